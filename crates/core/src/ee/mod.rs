//! Emotion Engine recompiler.
//!
//! `translator` decodes guest MIPS words into IR with dependency info;
//! `jit` owns the code generator, register allocation, the dispatcher
//! block, and the runtime entry point [`EeCore`].

/// EE code generator and runtime core.
pub mod jit;
/// EE decoder/translator.
pub mod translator;

pub use jit::EeCore;
pub use translator::{EeInstrInfo, EePipeline, EeTranslator};
