use std::{io, num::NonZeroUsize, sync::Arc};

use bytemuck::Pod;
use parking_lot::{Condvar, Mutex};

use crate::collective::{Collective, bytes_into_slot, check_slots};

/// The contributions of the gather currently in flight.
#[derive(Debug)]
struct Round {
    filled: usize,
    read: usize,
    slots: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct Shared {
    round: Mutex<Round>,
    cond: Condvar,
}

/// A group of workers living in the same process, one per thread.
///
/// Every gather is a round: workers deposit their contribution, wait until the
/// round is full, copy every slot out and the last reader opens the next round.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates the handles of a new group.
    ///
    /// # Arguments
    /// * `world_size` - The amount of workers in the group.
    ///
    /// # Returns
    /// One handle per rank, the handle at index `r` has rank `r`.
    pub fn group(world_size: NonZeroUsize) -> Vec<LocalGroup> {
        let world_size = world_size.get();

        let shared = Arc::new(Shared {
            round: Mutex::new(Round {
                filled: 0,
                read: 0,
                slots: vec![Vec::new(); world_size],
            }),
            cond: Condvar::new(),
        });

        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Collective for LocalGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_gather<T: Pod>(&self, slots: &mut [Vec<T>], local: &[T]) -> io::Result<()> {
        check_slots(slots, self.world_size)?;

        let Shared { round, cond } = &*self.shared;
        let mut guard = round.lock();

        // The previous round is still being copied out.
        while guard.filled == self.world_size {
            cond.wait(&mut guard);
        }

        guard.slots[self.rank].clear();
        guard.slots[self.rank].extend_from_slice(bytemuck::cast_slice(local));
        guard.filled += 1;

        if guard.filled == self.world_size {
            cond.notify_all();
        }

        while guard.filled < self.world_size {
            cond.wait(&mut guard);
        }

        let copied = guard
            .slots
            .iter()
            .zip(slots.iter_mut())
            .try_for_each(|(bytes, slot)| bytes_into_slot(bytes, slot));

        guard.read += 1;

        if guard.read == self.world_size {
            guard.filled = 0;
            guard.read = 0;
            cond.notify_all();
        }

        copied
    }
}
