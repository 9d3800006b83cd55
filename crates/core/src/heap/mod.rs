//! JIT code heap.
//!
//! This module provides:
//! 1. **`RwxRegion`:** one anonymous `mmap` with read/write/execute
//!    permissions, unmapped on drop.
//! 2. **`JitHeap`:** a power-of-two binned free-list allocator over the
//!    region (`alloc` submodule).
//! 3. **Block indices:** the EE page-array index with its direct-mapped
//!    fast lookup cache, and the VU key-hashed index (`index` submodule).

/// Binned free-list allocator.
pub mod alloc;
/// EE and VU block indices.
pub mod index;

pub use alloc::JitHeap;
pub use index::{EeBlockIndex, EeBlockRecord, VuBlockIndex, VuBlockKey, VuBlockRecord};

use crate::common::CoreError;

/// One anonymous read/write/execute mapping.
///
/// The recompilers write generated code into it and jump into it directly;
/// operating systems that enforce W^X are out of scope for this backend.
#[derive(Debug)]
pub struct RwxRegion {
    base: *mut u8,
    size: usize,
}

// The region is only ever used from the single thread that owns the core,
// but the container types holding it may be moved across threads before use.
unsafe impl Send for RwxRegion {}

impl RwxRegion {
    /// Maps a fresh RWX region of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RegionMap`] when the host refuses the mapping.
    pub fn new(tag: &'static str, size: usize) -> Result<Self, CoreError> {
        // SAFETY: anonymous private mapping with no file descriptor; the
        // returned region is exclusively owned by this value.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CoreError::RegionMap { tag, size });
        }
        Ok(Self {
            base: base.cast::<u8>(),
            size,
        })
    }

    /// Base address of the mapping.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for RwxRegion {
    fn drop(&mut self) {
        // SAFETY: base/size came from a successful mmap and nothing else
        // unmaps them.
        unsafe {
            let _ = libc::munmap(self.base.cast(), self.size);
        }
    }
}
