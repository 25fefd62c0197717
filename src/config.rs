//! Engine and volume configuration.
//!
//! Parsing a configuration file is out of scope (spec.md §1); this module only exposes the typed
//! builder the outer configuration layer is expected to populate, in the same builder-plus-`build`
//! shape the teacher crate uses for its disk buffer configuration.

use std::time::Duration;

use snafu::Snafu;

/// Hardware sector size / cache-block unit, per spec.md GLOSSARY.
pub const CACHE_BLOCK_SIZE: u64 = 512;
/// Unit of device space allocation, per spec.md GLOSSARY.
pub const STORE_BLOCK_SIZE: u64 = 8192;
pub const STORE_BLOCKS_PER_CACHE_BLOCK: u64 = STORE_BLOCK_SIZE / CACHE_BLOCK_SIZE;

/// Aggregation buffer capacity, in bytes. Taken from the original cache's `AGG_SIZE`.
pub const AGG_SIZE: usize = 4 * 1024 * 1024;
/// Threshold at which a pending aggregation buffer is flushed even without an explicit sync.
pub const AGG_HIGH_WATER: usize = AGG_SIZE / 2;
/// Width of the pre-overwrite evacuation scan window.
pub const EVACUATION_SIZE: u64 = 2 * AGG_SIZE as u64;
/// Width of one evacuation bucket, used to size the `evacuate[]` array.
pub const EVACUATION_BUCKET_SIZE: u64 = 2 * EVACUATION_SIZE;
/// Bytes scanned forward from the recovered write pointer during startup recovery.
pub const RECOVERY_SIZE: u64 = EVACUATION_SIZE;
/// Size of the evacuator's secondary lookaside index.
pub const LOOKASIDE_SIZE: usize = 256;
/// Entries probed per directory bucket before following an overflow `next` link.
pub const DIR_DEPTH: usize = 4;
/// Smallest volume size the engine will operate on; overridable in tests.
pub const MIN_VOL_SIZE: u64 = 1024 * 1024;

#[must_use]
pub fn round_to_store_block(x: u64) -> u64 {
    round_up(x, STORE_BLOCK_SIZE)
}

#[must_use]
pub fn round_to_cache_block(x: u64) -> u64 {
    round_up(x, CACHE_BLOCK_SIZE)
}

fn round_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Configuration for a single [`crate::volume::Volume`] (called a "Stripe" in spec.md).
#[derive(Clone, Debug)]
pub struct VolumeConfig {
    /// Number this volume is known by within its disk's free list.
    pub(crate) number: i32,
    /// Total size, in store blocks, reserved for this volume.
    pub(crate) size_store_blocks: u64,
    /// Number of directory segments; each segment has an independent free list.
    pub(crate) segments: usize,
    /// Number of buckets per segment.
    pub(crate) buckets: usize,
    /// Maximum concurrent writers per open object, absent an explicit override at `open_write`
    /// time.
    pub(crate) default_max_writers: u32,
    /// Interval between periodic `dir_sync` calls.
    pub(crate) dir_sync_interval: Duration,
    /// Whether checksum verification is enabled for reads on this volume.
    pub(crate) checksum_enabled: bool,
    /// Renamed `CACHE_ALLOW_MULTIPLE_WRITES` (spec.md Open Questions): whether a second writer may
    /// open a key that already has one open for writing, rather than being rejected outright.
    pub(crate) allow_if_writers: bool,
}

#[derive(Clone, Debug)]
pub struct VolumeConfigBuilder {
    number: i32,
    size_store_blocks: u64,
    segments: Option<usize>,
    buckets: Option<usize>,
    default_max_writers: Option<u32>,
    dir_sync_interval: Option<Duration>,
    checksum_enabled: Option<bool>,
    allow_if_writers: Option<bool>,
}

impl VolumeConfigBuilder {
    #[must_use]
    pub fn new(number: i32, size_store_blocks: u64) -> Self {
        Self {
            number,
            size_store_blocks,
            segments: None,
            buckets: None,
            default_max_writers: None,
            dir_sync_interval: None,
            checksum_enabled: None,
            allow_if_writers: None,
        }
    }

    #[must_use]
    pub fn segments(mut self, segments: usize) -> Self {
        self.segments = Some(segments);
        self
    }

    #[must_use]
    pub fn buckets(mut self, buckets: usize) -> Self {
        self.buckets = Some(buckets);
        self
    }

    #[must_use]
    pub fn default_max_writers(mut self, max: u32) -> Self {
        self.default_max_writers = Some(max);
        self
    }

    #[must_use]
    pub fn dir_sync_interval(mut self, interval: Duration) -> Self {
        self.dir_sync_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn checksum_enabled(mut self, enabled: bool) -> Self {
        self.checksum_enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn allow_if_writers(mut self, allow: bool) -> Self {
        self.allow_if_writers = Some(allow);
        self
    }

    /// # Errors
    ///
    /// Returns [`BuildError`] if the volume is smaller than [`MIN_VOL_SIZE`] or a parameter is
    /// internally inconsistent.
    pub fn build(self) -> Result<VolumeConfig, BuildError> {
        let size_bytes = self.size_store_blocks * STORE_BLOCK_SIZE;
        if size_bytes < MIN_VOL_SIZE {
            return Err(BuildError::InvalidParameter {
                param_name: "size_store_blocks",
                reason: format!("volume must be at least {MIN_VOL_SIZE} bytes"),
            });
        }

        let segments = self.segments.unwrap_or(1).max(1);
        let buckets = self.buckets.unwrap_or(16).max(1);

        if self.default_max_writers == Some(0) {
            return Err(BuildError::InvalidParameter {
                param_name: "default_max_writers",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(VolumeConfig {
            number: self.number,
            size_store_blocks: self.size_store_blocks,
            segments,
            buckets,
            default_max_writers: self.default_max_writers.unwrap_or(1),
            dir_sync_interval: self.dir_sync_interval.unwrap_or(Duration::from_secs(60)),
            checksum_enabled: self.checksum_enabled.unwrap_or(true),
            allow_if_writers: self.allow_if_writers.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_undersized_volume() {
        let err = VolumeConfigBuilder::new(0, 1).build().unwrap_err();
        assert!(matches!(err, BuildError::InvalidParameter { param_name, .. } if param_name == "size_store_blocks"));
    }

    #[test]
    fn accepts_min_vol_size() {
        let blocks = MIN_VOL_SIZE / STORE_BLOCK_SIZE;
        let config = VolumeConfigBuilder::new(1, blocks).build().unwrap();
        assert_eq!(config.segments, 1);
        assert_eq!(config.buckets, 16);
    }

    #[test]
    fn rounds_up_to_alignment() {
        assert_eq!(round_to_cache_block(1), CACHE_BLOCK_SIZE);
        assert_eq!(round_to_cache_block(CACHE_BLOCK_SIZE), CACHE_BLOCK_SIZE);
        assert_eq!(round_to_store_block(STORE_BLOCK_SIZE + 1), STORE_BLOCK_SIZE * 2);
    }
}
