//! Bulk transfers in and out of the shared mapping.
//!
//! The shared region is one memory-mapped buffer backed by an anonymous
//! temporary file, the same construction used for cross-thread frame sharing
//! elsewhere in the ecosystem. Cores and the host copy blocks in and out with
//! [`SharedArena::read`] / [`SharedArena::write`].
//!
//! ## Verified completion
//!
//! The underlying bulk-copy engine may report "idle" while the tail bytes of
//! a block are still in flight, so "copy finished" cannot be observed from
//! the engine itself. The waiting mode closes that race from the data side:
//! before the copy, the last destination byte is set to the bitwise
//! complement of the last source byte; after issuing the copy, the caller
//! spins until the last destination byte reads back as the true value. Only
//! then has the whole block landed. Non-waiting mode fires the copy and
//! returns immediately, leaving synchronization to the caller (a later
//! waited transfer, typically).

use std::ptr;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{DetectError, DetectResult};

/// Shared memory block with interior raw-pointer access.
///
/// The host writes the region single-threaded before any core is released;
/// during the run each core writes only into ranges it has claimed through
/// the exactly-once counter protocol, so concurrent writers never alias.
/// That protocol is what makes the `Sync` impl below sound.
#[derive(Debug)]
pub struct SharedArena {
    ptr: *mut u8,
    len: usize,
    // Keeps the mapping (and the pointer above) alive.
    _map: MmapMut,
}

// SAFETY: all mutation goes through `read`/`write`, whose byte ranges are
// disjoint across threads by the task-claim protocol (see module docs of
// `device`); the four shared counters live outside this mapping, behind
// their mutex.
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl SharedArena {
    /// Map a zeroed shared block of `len` bytes.
    pub fn new(len: usize) -> DetectResult<Self> {
        let file = tempfile::tempfile()
            .map_err(|e| DetectError::memory(format!("shared region backing file ({e})")))?;
        file.set_len(len as u64)
            .map_err(|e| DetectError::memory(format!("shared region of {len} bytes ({e})")))?;

        let mut map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| DetectError::memory(format!("shared region mapping ({e})")))?;
        let ptr = map.as_mut_ptr();

        Ok(Self {
            ptr,
            len,
            _map: map,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn range_ptr(&self, offset: usize, size: usize) -> *mut u8 {
        assert!(size >= 1, "transfer size must be at least one byte");
        assert!(
            offset + size <= self.len,
            "transfer range {offset}+{size} outside region of {} bytes",
            self.len
        );
        // SAFETY: bounds just checked against the live mapping.
        unsafe { self.ptr.add(offset) }
    }

    /// Copy `src` into the region at `offset`.
    pub fn write(&self, offset: usize, src: &[u8], wait: bool) {
        let dst = self.range_ptr(offset, src.len());
        // SAFETY: `dst` spans `src.len()` bytes inside the mapping and the
        // local slice cannot overlap it.
        unsafe { copy_block(dst, src.as_ptr(), src.len(), wait) };
    }

    /// Copy from the region at `offset` into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8], wait: bool) {
        let src = self.range_ptr(offset, dst.len());
        // SAFETY: as above, with the directions swapped.
        unsafe { copy_block(dst.as_mut_ptr(), src, dst.len(), wait) };
    }
}

/// Issue one bulk copy, optionally closing the completion race by spinning on
/// the last destination byte.
///
/// # Safety
///
/// `dst` and `src` must each be valid for `size` bytes and must not overlap.
unsafe fn copy_block(dst: *mut u8, src: *const u8, size: usize, wait: bool) {
    if wait {
        let last_index = size - 1;
        let last_source_byte = ptr::read_volatile(src.add(last_index));
        let last_dst_byte = dst.add(last_index);
        ptr::write_volatile(last_dst_byte, !last_source_byte);

        ptr::copy_nonoverlapping(src, dst, size);

        while ptr::read_volatile(last_dst_byte) != last_source_byte {
            std::hint::spin_loop();
        }
    } else {
        ptr::copy_nonoverlapping(src, dst, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let arena = SharedArena::new(256).unwrap();
        let payload: Vec<u8> = (0..64u8).collect();

        arena.write(16, &payload, true);
        let mut back = vec![0u8; 64];
        arena.read(16, &mut back, true);
        assert_eq!(back, payload);
    }

    #[test]
    fn test_waited_write_lands_fully() {
        // The wait mode inverts the tail byte before copying; make sure the
        // true value is in place when the call returns, including for a
        // single-byte transfer where the tail is the whole block.
        let arena = SharedArena::new(8).unwrap();
        arena.write(0, &[0xA5], true);
        let mut back = [0u8; 1];
        arena.read(0, &mut back, false);
        assert_eq!(back[0], 0xA5);
    }

    #[test]
    fn test_unwaited_write_is_still_copied() {
        let arena = SharedArena::new(32).unwrap();
        arena.write(0, &[1, 2, 3, 4], false);
        let mut back = [0u8; 4];
        arena.read(0, &mut back, true);
        assert_eq!(back, [1, 2, 3, 4]);
    }

    #[test]
    fn test_region_starts_zeroed() {
        let arena = SharedArena::new(128).unwrap();
        let mut back = [0xFFu8; 128];
        arena.read(0, &mut back, true);
        assert!(back.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disjoint_concurrent_writes() {
        let arena = SharedArena::new(1024).unwrap();
        std::thread::scope(|scope| {
            for lane in 0..8usize {
                let arena = &arena;
                scope.spawn(move || {
                    let block = [lane as u8 + 1; 128];
                    arena.write(lane * 128, &block, true);
                });
            }
        });
        for lane in 0..8usize {
            let mut back = [0u8; 128];
            arena.read(lane * 128, &mut back, true);
            assert!(back.iter().all(|&b| b == lane as u8 + 1));
        }
    }

    #[test]
    #[should_panic(expected = "outside region")]
    fn test_out_of_bounds_write_panics() {
        let arena = SharedArena::new(16).unwrap();
        arena.write(10, &[0u8; 8], false);
    }
}
