//! RAM cache (spec.md §4.9): an in-memory front for fragments below a configurable size cutoff,
//! with a pluggable eviction policy and optional compression before admission.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::key::CacheKey;

/// Compresses/decompresses a fragment's bytes before/after they sit in the RAM cache.
///
/// Distinct real compressors (FastLZ, zlib) are not in the crate's dependency stack (spec.md Open
/// Questions); this trait is the seam a real codec would plug into, and [`NoCompression`] is the
/// default.
pub trait Compressor: Send + Sync + std::fmt::Debug {
    fn compress(&self, data: &[u8]) -> Vec<u8>;
    fn decompress(&self, data: &[u8]) -> Option<Vec<u8>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decompress(&self, data: &[u8]) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }
}

/// Byte-oriented run-length encoder. Dependency-free stand-in for a real general-purpose codec,
/// usable when the cached payloads happen to be highly repetitive (e.g. padding-heavy fragments).
#[derive(Debug, Default, Clone, Copy)]
pub struct RunLengthCompressor;

impl Compressor for RunLengthCompressor {
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut iter = data.iter().peekable();
        while let Some(&byte) = iter.next() {
            let mut run: u8 = 1;
            while run < u8::MAX && iter.peek() == Some(&&byte) {
                iter.next();
                run += 1;
            }
            out.push(run);
            out.push(byte);
        }
        out
    }

    fn decompress(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() % 2 != 0 {
            return None;
        }
        let mut out = Vec::with_capacity(data.len());
        for pair in data.chunks_exact(2) {
            out.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
        }
        Some(out)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvictionPolicy {
    /// Evicts the least-recently-used entry regardless of size.
    Lru,
    /// Clocked LFU with size-weighted admission: evicts the entry with the lowest hits-per-byte
    /// score, periodically halving every entry's hit counter so stale popularity decays.
    Clfus,
}

#[derive(Debug)]
struct RamEntry {
    bytes: Vec<u8>,
    compressed: bool,
    hits: u32,
    last_access: u64,
}

/// Fixed-budget in-memory cache sitting in front of the on-disk volumes.
#[derive(Debug)]
pub struct RamCache {
    entries: Mutex<HashMap<CacheKey, RamEntry>>,
    budget_bytes: u64,
    used_bytes: AtomicU64,
    cutoff_bytes: u64,
    policy: EvictionPolicy,
    compressor: Box<dyn Compressor>,
    clock: AtomicU64,
    decay_interval_accesses: u64,
}

impl RamCache {
    #[must_use]
    pub fn new(budget_bytes: u64, cutoff_bytes: u64, policy: EvictionPolicy) -> Self {
        Self::with_compressor(budget_bytes, cutoff_bytes, policy, Box::new(NoCompression))
    }

    #[must_use]
    pub fn with_compressor(
        budget_bytes: u64,
        cutoff_bytes: u64,
        policy: EvictionPolicy,
        compressor: Box<dyn Compressor>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            budget_bytes,
            used_bytes: AtomicU64::new(0),
            cutoff_bytes,
            policy,
            compressor,
            clock: AtomicU64::new(0),
            decay_interval_accesses: 256,
        }
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// A fragment above the cutoff never enters the RAM cache; it is only ever served from disk.
    #[must_use]
    pub fn is_eligible(&self, size: u64) -> bool {
        size <= self.cutoff_bytes
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let tick = self.clock.fetch_add(1, Ordering::AcqRel);
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.hits += 1;
        entry.last_access = tick;
        let data = if entry.compressed {
            self.compressor.decompress(&entry.bytes)?
        } else {
            entry.bytes.clone()
        };
        Some(data)
    }

    /// Admits `data` for `key`, compressing it first, evicting under `policy` until there is
    /// enough budget. Silently declines admission (rather than erroring) if `data` alone exceeds
    /// the cache's total budget, matching the original cache's "best effort" RAM admission.
    pub fn insert(&self, key: CacheKey, data: &[u8]) {
        if !self.is_eligible(data.len() as u64) {
            return;
        }
        let compressed_bytes = self.compressor.compress(data);
        let (bytes, compressed) = if compressed_bytes.len() < data.len() {
            (compressed_bytes, true)
        } else {
            (data.to_vec(), false)
        };
        let size = bytes.len() as u64;
        if size > self.budget_bytes {
            return;
        }

        let tick = self.clock.fetch_add(1, Ordering::AcqRel);
        if tick % self.decay_interval_accesses == 0 {
            self.decay_hits();
        }

        let mut entries = self.entries.lock();
        self.make_room(&mut entries, size);

        let previous = entries.insert(
            key,
            RamEntry { bytes, compressed, hits: 1, last_access: tick },
        );
        let delta = size as i64 - previous.map_or(0, |e| e.bytes.len() as i64);
        if delta >= 0 {
            self.used_bytes.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.used_bytes.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
    }

    pub fn remove(&self, key: &CacheKey) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(key) {
            self.used_bytes.fetch_sub(entry.bytes.len() as u64, Ordering::AcqRel);
        }
    }

    fn make_room(&self, entries: &mut HashMap<CacheKey, RamEntry>, incoming: u64) {
        while self.used_bytes.load(Ordering::Acquire) + incoming > self.budget_bytes {
            let victim = match self.policy {
                EvictionPolicy::Lru => entries.iter().min_by_key(|(_, e)| e.last_access).map(|(k, _)| *k),
                EvictionPolicy::Clfus => entries
                    .iter()
                    .min_by(|(_, a), (_, b)| {
                        let score_a = f64::from(a.hits) / (a.bytes.len().max(1) as f64);
                        let score_b = f64::from(b.hits) / (b.bytes.len().max(1) as f64);
                        score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(k, _)| *k),
            };
            match victim {
                Some(key) => {
                    if let Some(entry) = entries.remove(&key) {
                        trace!(key = %key, bytes = entry.bytes.len(), policy = ?self.policy, "evicted RAM cache entry");
                        self.used_bytes.fetch_sub(entry.bytes.len() as u64, Ordering::AcqRel);
                    }
                }
                None => break,
            }
        }
    }

    fn decay_hits(&self) {
        for entry in self.entries.lock().values_mut() {
            entry.hits /= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> CacheKey {
        CacheKey::from_words([n, n, n, n])
    }

    #[test]
    fn eligible_respects_cutoff() {
        let cache = RamCache::new(1024, 100, EvictionPolicy::Lru);
        assert!(cache.is_eligible(50));
        assert!(!cache.is_eligible(200));
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let cache = RamCache::new(1024, 1024, EvictionPolicy::Lru);
        cache.insert(key(1), b"hello world");
        assert_eq!(cache.get(&key(1)).unwrap(), b"hello world");
    }

    #[test]
    fn lru_eviction_drops_least_recently_used() {
        let cache = RamCache::new(20, 20, EvictionPolicy::Lru);
        cache.insert(key(1), b"aaaaaaaaaa");
        cache.insert(key(2), b"bbbbbbbbbb");
        cache.get(&key(2));
        cache.insert(key(3), b"cccccccccc");
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some() || cache.get(&key(3)).is_some());
    }

    #[test]
    fn clfus_prefers_keeping_high_hit_entries() {
        let cache = RamCache::new(20, 20, EvictionPolicy::Clfus);
        cache.insert(key(1), b"aaaaaaaaaa");
        for _ in 0..10 {
            cache.get(&key(1));
        }
        cache.insert(key(2), b"bbbbbbbbbb");
        assert!(cache.get(&key(1)).is_some());
    }

    #[test]
    fn run_length_compressor_roundtrips() {
        let compressor = RunLengthCompressor;
        let data = b"aaaabbbccccccccd";
        let compressed = compressor.compress(data);
        assert!(compressed.len() < data.len());
        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }
}
