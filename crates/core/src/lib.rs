//! PlayStation 2 dynamic recompiler stack.
//!
//! This crate implements the recompilers for the Emotion Engine CPU and
//! the Vector Unit coprocessors:
//! 1. **IR:** one closed opcode set, instruction record, and block shared
//!    by both guest ISAs.
//! 2. **Translators:** the EE decoder with dual-issue dependency info, and
//!    the VU decoder with its pipeline and flag analysis passes.
//! 3. **Code generation:** an x86-64 emitter with a backward-growing
//!    literal pool, a bounded register allocator with age-based eviction
//!    and per-lane clamp tracking, and per-ISA lowerers.
//! 4. **JIT heap:** a binned free-list allocator over one RWX region, with
//!    guest-page invalidation, a direct-mapped lookup cache, and
//!    context-keyed VU blocks.
//! 5. **Runtime:** dispatcher prologues, cycle accounting, and the
//!    C-callable host interface ([`EeBus`]/[`VuBus`]).
//!
//! Everything runs on the single thread that owns the guest state; the
//! host embedder supplies memory accessors and exception handlers.

/// Common types: errors and checksums.
pub mod common;
/// Configuration (heap sizes and thresholds).
pub mod config;
/// Emotion Engine recompiler.
pub mod ee;
/// Host code emission (scratch block + x86-64 encoder).
pub mod emitter;
/// JIT code heap and block indices.
pub mod heap;
/// Intermediate representation.
pub mod ir;
/// Register allocation tables and policies.
pub mod regalloc;
/// Guest state and the host interface.
pub mod state;
/// Vector Unit recompiler.
pub mod vu;

pub use common::{crc::crc32c, CoreError};
pub use config::{CoreConfig, JitConfig};
pub use ee::EeCore;
pub use state::{EeBus, EeState, VfReg, VuBus, VuState};
pub use vu::VuCore;
