use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    thread,
    time::Duration,
};

use bytemuck::Pod;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    collective::{Collective, bytes_into_slot, check_slots},
    frame::{read_frame, write_frame},
};

const CONNECT_ATTEMPTS: usize = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// The listening end of the master (rank `0`) before the group is complete.
pub struct Rendezvous {
    listener: TcpListener,
}

impl Rendezvous {
    /// Binds the master's listener.
    ///
    /// # Arguments
    /// * `addr` - The address to listen at, port `0` picks a free port.
    ///
    /// # Returns
    /// A new `Rendezvous` instance or an `io::Error` if the bind failed.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener })
    }

    /// Returns the address the master is listening at.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocks until the remaining `world_size - 1` workers connected.
    ///
    /// Every worker announces its rank in its first frame, the master keeps
    /// the streams ordered by rank.
    ///
    /// # Arguments
    /// * `world_size` - The amount of workers in the group, the master included.
    ///
    /// # Returns
    /// The master's `TcpGroup` or an `io::Error` if a worker announced an invalid or repeated rank.
    pub fn accept(self, world_size: usize) -> io::Result<TcpGroup> {
        let mut peers: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut buf = Vec::new();

        for _ in 1..world_size {
            let (mut stream, addr) = self.listener.accept()?;
            stream.set_nodelay(true)?;

            read_frame(&mut stream, &mut buf)?;
            let rank = decode_rank(&buf)?;

            if rank == 0 || rank >= world_size {
                return Err(invalid_data(format!(
                    "worker at {addr} announced rank {rank}, world size is {world_size}"
                )));
            }

            if peers[rank - 1].replace(stream).is_some() {
                return Err(invalid_data(format!("rank {rank} connected twice")));
            }

            debug!(rank = rank; "worker connected from {addr}");
        }

        let peers = peers.into_iter().flatten().collect();
        info!("group of {world_size} workers is complete");

        Ok(TcpGroup {
            rank: 0,
            world_size,
            link: Mutex::new(Link::Master { peers }),
        })
    }
}

enum Link {
    Master { peers: Vec<TcpStream> },
    Peer { master: TcpStream },
}

/// A group of workers connected through TCP in a star rooted at rank `0`.
///
/// On every gather the workers send their contribution to the master, which
/// sends back every contribution ordered by rank.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    link: Mutex<Link>,
}

impl TcpGroup {
    /// Connects a non-master worker to the master.
    ///
    /// Retries for a while since the master might not be listening yet.
    ///
    /// # Arguments
    /// * `addr` - The master's address.
    /// * `rank` - This worker's rank, must be in `1..world_size`.
    /// * `world_size` - The amount of workers in the group.
    ///
    /// # Returns
    /// A new `TcpGroup` instance or an `io::Error` if the connection failed.
    pub fn connect<A: ToSocketAddrs>(addr: A, rank: usize, world_size: usize) -> io::Result<Self> {
        if rank == 0 || rank >= world_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rank {rank} can't connect to a group of size {world_size}"),
            ));
        }

        let mut attempt = 0;
        let mut master = loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    warn!(rank = rank; "master not reachable yet: {e}");
                    attempt += 1;
                    thread::sleep(CONNECT_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        };

        master.set_nodelay(true)?;
        write_frame(&mut master, &(rank as u64).to_be_bytes())?;

        Ok(Self {
            rank,
            world_size,
            link: Mutex::new(Link::Peer { master }),
        })
    }
}

impl Collective for TcpGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_gather<T: Pod>(&self, slots: &mut [Vec<T>], local: &[T]) -> io::Result<()> {
        check_slots(slots, self.world_size)?;

        let mut link = self.link.lock();
        let mut buf = Vec::new();

        match &mut *link {
            Link::Master { peers } => {
                let mut payloads = Vec::with_capacity(self.world_size);
                payloads.push(bytemuck::cast_slice::<T, u8>(local).to_vec());

                for peer in peers.iter_mut() {
                    read_frame(peer, &mut buf)?;
                    payloads.push(buf.clone());
                }

                for peer in peers.iter_mut() {
                    for payload in &payloads {
                        write_frame(peer, payload)?;
                    }
                }

                payloads
                    .iter()
                    .zip(slots.iter_mut())
                    .try_for_each(|(bytes, slot)| bytes_into_slot(bytes, slot))
            }
            Link::Peer { master } => {
                write_frame(master, bytemuck::cast_slice(local))?;

                for slot in slots.iter_mut() {
                    read_frame(master, &mut buf)?;
                    bytes_into_slot(&buf, slot)?;
                }

                Ok(())
            }
        }
    }
}

fn decode_rank(buf: &[u8]) -> io::Result<usize> {
    let bytes: [u8; 8] = buf
        .try_into()
        .map_err(|_| invalid_data(format!("rank frame has {} bytes, expected 8", buf.len())))?;

    Ok(u64::from_be_bytes(bytes) as usize)
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
