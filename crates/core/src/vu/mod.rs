//! Vector Unit recompiler.
//!
//! `pipeline` models the guest-visible pipelines and produces the per-PC
//! analysis; `translator` turns UPPER/LOWER pairs into IR; `jit` owns the
//! packed-float code generator and the runtime core [`VuCore`].

/// VU code generator and runtime core.
pub mod jit;
/// Pipeline analysis passes.
pub mod pipeline;
/// VU decoder/translator.
pub mod translator;

pub use jit::VuCore;
pub use pipeline::{VuAnalysis, VuDecoder, VuInstrInfo, NO_PREV_PC};
pub use translator::VuTranslator;
