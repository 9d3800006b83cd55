//! Common types shared by every recompiler subsystem.
//!
//! This module provides:
//! 1. **Errors:** the recoverable error taxonomy (`CoreError`).
//! 2. **Checksums:** CRC-32C used to key VU microprograms.

/// CRC-32C (Castagnoli) over byte slices; keys VU microprograms.
pub mod crc;
/// Recoverable error taxonomy for the recompiler core.
pub mod error;

pub use error::CoreError;
