//! Aggregation writer (spec.md §4.6): batches fragments into one buffer so a stripe's many small
//! writes become a single sequential I/O.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use snafu::Snafu;

use crate::{
    config::{round_to_cache_block, AGG_HIGH_WATER, AGG_SIZE},
    io::AioBridge,
    key::CacheKey,
};

#[derive(Debug, Snafu)]
pub enum AggregateError {
    #[snafu(display("fragment of {size} bytes exceeds the aggregation buffer capacity of {capacity}"))]
    FragmentTooLarge { size: usize, capacity: usize },

    #[snafu(display("aggregation flush I/O error: {source}"))]
    Io { source: std::io::Error },
}

impl From<std::io::Error> for AggregateError {
    fn from(source: std::io::Error) -> Self {
        AggregateError::Io { source }
    }
}

/// Where a staged fragment landed once the buffer is eventually flushed.
#[derive(Clone, Copy, Debug)]
pub struct StagedLocation {
    pub key: CacheKey,
    /// Byte offset from the start of the flushed write, i.e. relative to the volume offset the
    /// buffer is flushed at.
    pub buffer_offset: u64,
    pub len: u32,
}

/// Accumulates encoded fragments in memory until the high-water mark is hit or a caller forces a
/// flush, then hands the whole batch to the [`AioBridge`] in one write.
#[derive(Debug)]
pub struct AggregationBuffer {
    buf: BytesMut,
    staged: Vec<StagedLocation>,
    capacity: usize,
}

impl AggregationBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(AGG_SIZE),
            staged: Vec::new(),
            capacity: AGG_SIZE,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// A flush is due once the buffer has accumulated past the high-water mark, so a flush never
    /// waits for the buffer to be completely full (spec.md §4.6 "high water mark").
    #[must_use]
    pub fn should_flush(&self) -> bool {
        self.buf.len() >= AGG_HIGH_WATER
    }

    /// Appends an already-framed fragment (header + alternates + payload, unpadded) to the buffer,
    /// zero-padding it out to the next cache-block boundary so every fragment in the buffer starts
    /// on a [`crate::config::CACHE_BLOCK_SIZE`]-aligned offset once flushed (spec.md §4.5's
    /// alignment contract; `Dir.offset` is stored in cache blocks and only ever multiplied back by
    /// `CACHE_BLOCK_SIZE`, so an unaligned `buffer_offset` here would silently truncate on read).
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::FragmentTooLarge`] if `encoded`, once padded, cannot fit in an
    /// empty buffer; callers should split oversized objects into multiple fragments before staging.
    pub fn stage(&mut self, key: CacheKey, encoded: &[u8]) -> Result<StagedLocation, AggregateError> {
        let padded = round_to_cache_block(encoded.len() as u64) as usize;
        if padded > self.capacity {
            return Err(AggregateError::FragmentTooLarge {
                size: encoded.len(),
                capacity: self.capacity,
            });
        }
        let offset = self.buf.len() as u64;
        debug_assert_eq!(offset % crate::config::CACHE_BLOCK_SIZE, 0);
        self.buf.extend_from_slice(encoded);
        self.buf.resize(self.buf.len() + (padded - encoded.len()), 0);
        let location = StagedLocation {
            key,
            buffer_offset: offset,
            len: encoded.len() as u32,
        };
        self.staged.push(location);
        Ok(location)
    }

    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Writes the accumulated buffer to `file` at `base_offset` in one call, then clears staged
    /// state. Returns the fragments that were just durably written, so the caller can update the
    /// directory entries that previously pointed into this in-memory buffer
    /// ([`crate::directory::dir_agg_buf_valid`]).
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the bridge; the buffer is left unflushed on failure so a retry
    /// can be attempted.
    pub async fn flush(
        &mut self,
        aio: &Arc<dyn AioBridge>,
        file: Arc<std::fs::File>,
        base_offset: u64,
    ) -> Result<Vec<StagedLocation>, AggregateError> {
        if self.buf.is_empty() {
            return Ok(Vec::new());
        }
        let len = self.buf.len();
        let bytes: Bytes = std::mem::replace(&mut self.buf, BytesMut::with_capacity(self.capacity)).freeze();
        aio.write_at(file, base_offset, bytes).await?;
        trace!(base_offset, len, "flushed aggregation buffer");
        Ok(std::mem::take(&mut self.staged))
    }
}

impl Default for AggregationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> CacheKey {
        CacheKey::from_words([n, n, n, n])
    }

    #[test]
    fn stage_tracks_offsets_within_buffer() {
        let mut agg = AggregationBuffer::new();
        let first = agg.stage(key(1), &[1, 2, 3]).unwrap();
        let second = agg.stage(key(2), &[4, 5]).unwrap();
        assert_eq!(first.buffer_offset, 0);
        assert_eq!(first.len, 3);
        assert_eq!(second.buffer_offset, crate::config::CACHE_BLOCK_SIZE);
        assert_eq!(agg.len(), 2 * crate::config::CACHE_BLOCK_SIZE as usize);
    }

    #[test]
    fn stage_pads_every_fragment_to_a_cache_block_boundary() {
        let mut agg = AggregationBuffer::new();
        for n in 0..3 {
            let location = agg.stage(key(n), &[n as u8; 7]).unwrap();
            assert_eq!(location.buffer_offset % crate::config::CACHE_BLOCK_SIZE, 0);
        }
    }

    #[test]
    fn oversized_fragment_is_rejected() {
        let mut agg = AggregationBuffer::new();
        let oversized = vec![0u8; AGG_SIZE + 1];
        let err = agg.stage(key(1), &oversized).unwrap_err();
        assert!(matches!(err, AggregateError::FragmentTooLarge { .. }));
    }

    #[test]
    fn should_flush_once_high_water_mark_is_crossed() {
        let mut agg = AggregationBuffer::new();
        assert!(!agg.should_flush());
        let chunk = vec![0u8; AGG_HIGH_WATER];
        agg.stage(key(1), &chunk).unwrap();
        assert!(agg.should_flush());
    }
}
