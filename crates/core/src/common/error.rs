//! Error taxonomy for the recompiler core.
//!
//! Only guest-recoverable conditions surface as `Result` errors; conditions
//! that indicate a bug in the recompiler itself (allocating a locked host
//! register, heap header corruption) are hard panics carrying a subsystem
//! tag, because no caller can meaningfully continue past them.

use thiserror::Error;

/// Recoverable failures reported by the recompiler core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The JIT heap could not satisfy an allocation even after a full
    /// flush. The block being compiled is larger than the entire heap.
    #[error(
        "JIT heap exhausted: block of {requested} bytes cannot fit \
         ({in_use}/{capacity} bytes in use after flush)"
    )]
    HeapExhausted {
        /// Size of the failed allocation in bytes.
        requested: usize,
        /// Bytes in use at the time of the failure.
        in_use: usize,
        /// Total heap capacity in bytes.
        capacity: usize,
    },

    /// The host refused to map an RWX region of the requested size.
    #[error("unable to map a {size}-byte RWX region for the {tag} JIT heap")]
    RegionMap {
        /// Subsystem tag (`"EE"` or `"VU"`).
        tag: &'static str,
        /// Requested region size in bytes.
        size: usize,
    },
}
