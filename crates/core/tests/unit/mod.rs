//! Unit tests per recompiler subsystem.

/// EE end-to-end execution scenarios (x86-64 hosts only).
#[cfg(target_arch = "x86_64")]
pub mod ee_exec;
/// EE translator structure and determinism.
pub mod ee_translate;
/// JIT heap allocator and block index properties.
pub mod heap;
/// VU end-to-end execution scenarios (x86-64 hosts only).
#[cfg(target_arch = "x86_64")]
pub mod vu_exec;
/// VU pipeline analysis.
pub mod vu_pipeline;
/// VU translator structure.
pub mod vu_translate;
