//! Recompiler configuration.
//!
//! Sizes and thresholds for both JIT heaps. Embedders either use
//! `CoreConfig::default()` or deserialize a configuration from JSON.

use serde::Deserialize;

/// Default EE JIT heap size: large games recompile tens of thousands of
/// blocks, so the EE heap is an order of magnitude bigger than the VU one.
pub const DEFAULT_EE_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Default VU JIT heap size.
pub const DEFAULT_VU_HEAP_SIZE: usize = 32 * 1024 * 1024;

/// Free space required before compiling another block. If the best-fit
/// search cannot produce a block of this size, the heap is flushed before
/// the next compile rather than mid-compile (a mid-compile flush would
/// free the prologue block out from under us).
pub const DEFAULT_HEAP_HIGH_WATER: usize = 5 * 1024 * 1024;

/// Configuration for one recompiler core.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct JitConfig {
    /// RWX region size in bytes.
    pub heap_size: usize,
    /// High-water free-space threshold checked before each entry.
    pub high_water: usize,
}

impl JitConfig {
    /// EE defaults (64 MiB heap).
    pub const fn ee() -> Self {
        Self {
            heap_size: DEFAULT_EE_HEAP_SIZE,
            high_water: DEFAULT_HEAP_HIGH_WATER,
        }
    }

    /// VU defaults (32 MiB heap).
    pub const fn vu() -> Self {
        Self {
            heap_size: DEFAULT_VU_HEAP_SIZE,
            high_water: DEFAULT_HEAP_HIGH_WATER,
        }
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self::ee()
    }
}

/// Root configuration for the whole recompiler stack.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CoreConfig {
    /// EE recompiler settings.
    pub ee: JitConfig,
    /// VU recompiler settings.
    pub vu: JitConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ee: JitConfig::ee(),
            vu: JitConfig::vu(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_differ_per_core() {
        let config = CoreConfig::default();
        assert!(config.ee.heap_size > config.vu.heap_size);
        assert!(config.ee.high_water > 0);
    }

    #[test]
    fn partial_json_overrides_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{ "vu": { "heap_size": 8388608 } }"#).unwrap();
        assert_eq!(config.vu.heap_size, 8 * 1024 * 1024);
        assert_eq!(config.vu.high_water, DEFAULT_HEAP_HIGH_WATER);
        assert_eq!(config.ee.heap_size, DEFAULT_EE_HEAP_SIZE);
    }
}
