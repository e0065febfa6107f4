//! Low-level shared memory mapping

use crate::error::{Result, TombsError};
use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ptr::NonNull;

/// Handle to an anonymous shared memory region
///
/// The mapping is `MAP_SHARED`, so it stays shared with any process forked
/// after it was created. It is unmapped exactly once, when the handle drops.
pub struct SharedRegion {
    addr: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is only ever accessed through atomics or through byte
// ranges that a single writer reserved atomically
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map a new zero-filled shared region of `size` bytes
    pub fn anonymous(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(TombsError::InvalidCapacity {
                what: "shared region size",
                got: size,
            });
        }

        let addr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
            )
            .map_err(|e| TombsError::Mmap {
                size,
                source: e.into(),
            })?
        };

        let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| TombsError::Mmap {
            size,
            source: std::io::Error::other("mmap returned null"),
        })?;

        // Anonymous pages arrive zeroed, but the layout relies on it
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        Ok(Self { addr, size })
    }

    /// Get raw pointer to the start of the region
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the region in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}
