// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Tuning knobs for uploads.

use std::time::Duration;

/// Bytes per pixel of the source layout and per staging-buffer element.
pub const BYTES_PER_ELEMENT: usize = 4;

/// Edge length of the square workgroup the conversion kernel is compiled for.
pub const TILE_SIZE: u32 = 8;

/// Configuration for a [crate::TextureUploader].
///
/// ```
/// use std::time::Duration;
/// use texture_streaming::UploadConfig;
///
/// let config = UploadConfig {
///     time_budget: Duration::from_millis(1),
///     ..UploadConfig::default()
/// };
/// assert_eq!(config.chunk_bytes, 1 << 17);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Wall-clock time a copy may run before it yields back to the scheduler.
    pub time_budget: Duration,
    /// Bytes written per copy iteration.  Must be a positive multiple of [BYTES_PER_ELEMENT].
    pub chunk_bytes: usize,
    /// Smallest staging buffer ever allocated, in 4-byte elements.
    pub min_staging_elements: usize,
    /// Workgroup edge of the conversion kernel.  Fixed by the kernel; informational.
    pub tile_size: u32,
    /// Length of one yield.  Zero yields for a single poll.
    pub yield_sleep: Duration,
    /// Label prefix for GPU objects.
    pub debug_name: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            time_budget: Duration::from_millis(3),
            chunk_bytes: 1 << 17,
            min_staging_elements: 4096 * 4096,
            tile_size: TILE_SIZE,
            yield_sleep: Duration::ZERO,
            debug_name: "texture_streaming".to_string(),
        }
    }
}

impl UploadConfig {
    /// Defaults, overridden by `TEXTURE_STREAMING_TIME_BUDGET_US`, `TEXTURE_STREAMING_CHUNK_BYTES`
    /// and `TEXTURE_STREAMING_MIN_STAGING_ELEMENTS` when they are set and parse.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = UploadConfig::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(us) = parse("TEXTURE_STREAMING_TIME_BUDGET_US") {
            config.time_budget = Duration::from_micros(us);
        }
        if let Some(bytes) = parse("TEXTURE_STREAMING_CHUNK_BYTES") {
            config.chunk_bytes = bytes as usize;
        }
        if let Some(elements) = parse("TEXTURE_STREAMING_MIN_STAGING_ELEMENTS") {
            config.min_staging_elements = elements as usize;
        }
        let budget_us = config.time_budget.as_micros() as u64;
        logwise::info_sync!(
            "upload config: budget {budget_us}us, chunk {chunk} bytes, min staging {min} elements",
            budget_us = budget_us,
            chunk = config.chunk_bytes,
            min = config.min_staging_elements
        );
        config
    }

    /// Panics when the configuration cannot work.
    pub fn validate(&self) {
        assert!(
            self.chunk_bytes > 0 && self.chunk_bytes % BYTES_PER_ELEMENT == 0,
            "chunk_bytes ({}) must be a positive multiple of {}",
            self.chunk_bytes,
            BYTES_PER_ELEMENT
        );
        assert!(
            self.min_staging_elements > 0,
            "min_staging_elements must be non-zero"
        );
        assert_eq!(
            self.tile_size, TILE_SIZE,
            "the conversion kernel is compiled for {TILE_SIZE}x{TILE_SIZE} tiles"
        );
    }
}
