use std::io;

use bytemuck::Pod;

/// The distributed runtime seen by a single worker.
///
/// Every call to `all_gather` blocks until all the workers of the group issued
/// the matching call. Callers must therefore issue collective calls in the
/// same order on every worker, otherwise the group deadlocks.
pub trait Collective {
    /// Returns the amount of workers in the group.
    fn world_size(&self) -> usize;

    /// Returns the rank of this worker, in `0..world_size`.
    fn rank(&self) -> usize;

    /// Gathers `local` from every worker of the group.
    ///
    /// # Arguments
    /// * `slots` - One slot per worker, after the call `slots[r]` holds the contribution of rank `r`.
    ///             Contributions may have different lengths, slots are resized accordingly.
    /// * `local` - This worker's contribution.
    ///
    /// # Returns
    /// An `io::Error` if `slots` doesn't have exactly `world_size` entries or the transport failed.
    fn all_gather<T: Pod>(&self, slots: &mut [Vec<T>], local: &[T]) -> io::Result<()>;

    /// Returns whether this worker has rank `0`.
    fn is_master(&self) -> bool {
        self.rank() == 0
    }
}

/// Validates that the caller provided one slot per worker.
pub(crate) fn check_slots<T>(slots: &[Vec<T>], world_size: usize) -> io::Result<()> {
    if slots.len() != world_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "all_gather got {} slots, expected one per worker ({world_size})",
                slots.len()
            ),
        ));
    }

    Ok(())
}

/// Copies a raw byte payload into a typed slot.
pub(crate) fn bytes_into_slot<T: Pod>(bytes: &[u8], slot: &mut Vec<T>) -> io::Result<()> {
    let size = size_of::<T>();

    if size == 0 || bytes.len() % size != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("received {} bytes, not a multiple of {size}", bytes.len()),
        ));
    }

    slot.clear();
    slot.resize(bytes.len() / size, T::zeroed());
    bytemuck::cast_slice_mut::<T, u8>(slot).copy_from_slice(bytes);
    Ok(())
}
