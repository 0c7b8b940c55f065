//! Implements the framing used between workers, the length of every frame is written first.

use std::io::{self, Read, Write};

use crate::{LEN_TYPE_SIZE, LenType};

/// The largest payload a peer may announce, anything longer is rejected before allocating.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Writes the length header and `bytes` into `tx`.
///
/// # Arguments
/// * `tx` - The underlying writer.
/// * `bytes` - The frame's payload.
///
/// # Returns
/// A result object that returns `io::Error` on failure, `InvalidInput` if
/// `bytes` is longer than `MAX_FRAME_LEN`.
pub fn write_frame<W: Write>(tx: &mut W, bytes: &[u8]) -> io::Result<()> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds the {MAX_FRAME_LEN} bytes limit", bytes.len()),
        ));
    }

    let header = (bytes.len() as LenType).to_be_bytes();

    tx.write_all(&header)?;
    tx.write_all(bytes)?;
    tx.flush()
}

/// Reads a single frame from `rx` into `buf`, overwriting its previous contents.
///
/// # Arguments
/// * `rx` - The underlying reader.
/// * `buf` - Where the frame's payload will be written.
///
/// # Returns
/// A result object that returns `io::Error` on failure, `InvalidData` if the
/// header announces more than `MAX_FRAME_LEN` bytes.
pub fn read_frame<R: Read>(rx: &mut R, buf: &mut Vec<u8>) -> io::Result<()> {
    let mut size_buf = [0; LEN_TYPE_SIZE];
    rx.read_exact(&mut size_buf)?;
    let len = LenType::from_be_bytes(size_buf);

    let len = match usize::try_from(len) {
        Ok(len) if len <= MAX_FRAME_LEN => len,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }
    };

    buf.clear();
    buf.resize(len, 0);
    rx.read_exact(buf)
}
