//! Directory: fixed-size open-addressed hash index from key to on-disk location (spec.md §3, §4.4).

use crate::{config::DIR_DEPTH, key::CacheKey};

/// Fixed-size index record locating a `Doc`.
///
/// `offset` is measured in cache-blocks within the owning volume's data region; zero means the
/// slot is empty. `next` chains overflow entries within the same segment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Dir {
    pub offset: u64,
    pub approx_size: u32,
    pub tag: u32,
    pub phase: bool,
    pub head: bool,
    /// Eviction-exempt deadline (unix seconds), or 0 if not pinned.
    pub pinned: u32,
    pub(crate) next: Option<u32>,
}

impl Dir {
    #[must_use]
    pub fn new(offset: u64, approx_size: u32, phase: bool, head: bool, pinned: u32) -> Self {
        Self { offset, approx_size, tag: 0, phase, head, pinned, next: None }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    #[must_use]
    pub fn is_pinned(&self, now: u32) -> bool {
        self.pinned != 0 && self.pinned > now
    }
}

/// One directory segment: a `buckets * DIR_DEPTH` direct-addressed region, plus an overflow pool
/// of the same size used for bucket chains that overrun their `DIR_DEPTH` slots.
#[derive(Debug)]
struct DirSegment {
    entries: Vec<Dir>,
    buckets: usize,
    free_overflow: Vec<u32>,
}

impl DirSegment {
    fn new(buckets: usize) -> Self {
        let direct_len = buckets * DIR_DEPTH;
        let overflow_len = direct_len;
        let total = direct_len + overflow_len;
        let free_overflow = (direct_len as u32..total as u32).collect();
        Self {
            entries: vec![Dir::default(); total],
            buckets,
            free_overflow,
        }
    }

    fn bucket_base(&self, bucket: usize) -> usize {
        bucket * DIR_DEPTH
    }

    fn direct_len(&self) -> usize {
        self.buckets * DIR_DEPTH
    }
}

#[derive(Debug)]
pub struct DirectoryError;

/// In-memory directory array for one [`crate::volume::Volume`]. Entries are partitioned into
/// independent segments, each with its own overflow free list (spec.md §3 invariant: "each segment
/// has an independent free list").
#[derive(Debug)]
pub struct Directory {
    segments: Vec<DirSegment>,
    buckets_per_segment: usize,
}

impl Directory {
    #[must_use]
    pub fn new(num_segments: usize, buckets_per_segment: usize) -> Self {
        Self {
            segments: (0..num_segments).map(|_| DirSegment::new(buckets_per_segment)).collect(),
            buckets_per_segment,
        }
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets_per_segment
    }

    fn locate(&self, key: &CacheKey) -> (usize, usize) {
        let segment = (key.slice32(0) as u64 % self.segments.len() as u64) as usize;
        let bucket = (key.slice32(1) as u64 % self.buckets_per_segment as u64) as usize;
        (segment, bucket)
    }

    /// Walks the bucket chain starting at `bucket(key)`. If `resume_after` names an entry index
    /// previously returned as a collision, probing resumes just past it (spec.md §4.4
    /// `last_collision` parameter), letting a caller retry past a tag collision without
    /// restarting the whole chain.
    ///
    /// Returns the matching entry's index (stable for the lifetime of this directory generation)
    /// and a copy of it, or `None` once the chain is exhausted.
    #[must_use]
    pub fn probe(&self, key: &CacheKey, resume_after: Option<u32>) -> Option<(u32, Dir)> {
        let (segment_idx, bucket) = self.locate(key);
        let segment = &self.segments[segment_idx];
        let base = segment.bucket_base(bucket);

        let mut chain = self.chain_indices(segment_idx, bucket);
        let mut skipping = resume_after.is_some();
        for idx in chain.by_ref() {
            if skipping {
                if Some(idx) == resume_after {
                    skipping = false;
                }
                continue;
            }
            let entry = segment.entries[idx as usize];
            if entry.is_empty() {
                continue;
            }
            if entry.tag == key.tag() {
                return Some((idx, entry));
            }
        }
        let _ = base;
        None
    }

    fn chain_indices(&self, segment_idx: usize, bucket: usize) -> impl Iterator<Item = u32> + '_ {
        let segment = &self.segments[segment_idx];
        let base = segment.bucket_base(bucket);
        let mut next = Some(base as u32);
        std::iter::from_fn(move || {
            let current = next?;
            let entry = segment.entries[current as usize];
            next = if entry.is_empty() && current as usize == base {
                // The direct slot is empty, meaning the chain is genuinely empty -- but more
                // direct slots in [base, base+DIR_DEPTH) may still hold entries, so we only stop
                // descending into overflow once all direct slots are exhausted.
                advance_within_bucket(base, current)
            } else {
                entry.next.or_else(|| advance_within_bucket(base, current))
            };
            Some(current)
        })
    }

    /// Inserts `dir` for `key`, choosing a free slot in the bucket's direct region, or chaining
    /// into the segment's overflow pool. On bucket exhaustion (no free direct slot, no overflow
    /// capacity), evicts the unpinned entry with the largest `approx_size` in the bucket (ties
    /// broken by earliest insertion order, i.e. lowest index), per spec.md §4.4 collision policy.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] only if the bucket is entirely pinned and overflow is exhausted.
    pub fn insert(&mut self, key: &CacheKey, mut dir: Dir) -> Result<u32, DirectoryError> {
        let (segment_idx, bucket) = self.locate(key);
        dir.tag = key.tag();

        let idx = self.find_slot_for_insert(segment_idx, bucket)?;
        let segment = &mut self.segments[segment_idx];
        let preserved_next = segment.entries[idx as usize].next;
        dir.set_next(preserved_next.filter(|_| is_overflow(idx, segment.direct_len())));
        segment.entries[idx as usize] = dir;
        Ok(idx)
    }

    fn find_slot_for_insert(&mut self, segment_idx: usize, bucket: usize) -> Result<u32, DirectoryError> {
        let base;
        {
            let segment = &self.segments[segment_idx];
            base = segment.bucket_base(bucket);
            for offset in 0..DIR_DEPTH {
                let idx = base + offset;
                if segment.entries[idx].is_empty() {
                    return Ok(idx as u32);
                }
            }
        }

        // All direct slots occupied: find the tail of the chain and either extend it with a fresh
        // overflow slot, or evict a victim if overflow is exhausted.
        let chain: Vec<u32> = self.chain_indices(segment_idx, bucket).collect();
        let segment = &mut self.segments[segment_idx];

        if let Some(&free_idx) = segment.free_overflow.last() {
            segment.free_overflow.pop();
            let tail = *chain.last().expect("bucket chain is never empty once direct slots are full");
            segment.entries[tail as usize].next = Some(free_idx);
            return Ok(free_idx);
        }

        // No overflow capacity left: evict per the collision policy.
        let victim = chain
            .iter()
            .copied()
            .filter(|&idx| !segment.entries[idx as usize].is_pinned(current_unix_time()))
            .max_by_key(|&idx| (segment.entries[idx as usize].approx_size, std::cmp::Reverse(idx)))
            .ok_or(DirectoryError)?;

        Ok(victim)
    }

    /// Clears the entry at `idx` for `key`, relinking its predecessor's `next` pointer so the
    /// chain stays intact.
    pub fn delete_at(&mut self, key: &CacheKey, idx: u32) {
        let (segment_idx, bucket) = self.locate(key);
        let segment = &mut self.segments[segment_idx];
        let base = segment.bucket_base(bucket);
        let direct_len = segment.direct_len();

        if is_overflow(idx, direct_len) {
            // Find the predecessor in the chain and splice this entry out.
            let mut cursor = base as u32;
            loop {
                let next = segment.entries[cursor as usize].next;
                match next {
                    Some(n) if n == idx => {
                        segment.entries[cursor as usize].next = segment.entries[idx as usize].next;
                        break;
                    }
                    Some(n) => cursor = n,
                    None => break,
                }
            }
            segment.entries[idx as usize] = Dir::default();
            segment.free_overflow.push(idx);
        } else {
            segment.entries[idx as usize] = Dir::default();
        }
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey, idx: u32) -> Option<Dir> {
        let (segment_idx, _) = self.locate(key);
        self.segments[segment_idx].entries.get(idx as usize).copied()
    }

    /// Iterates every occupied entry across all segments, used by recovery and by `scan()`.
    pub fn iter_occupied(&self) -> impl Iterator<Item = Dir> + '_ {
        self.segments
            .iter()
            .flat_map(|s| s.entries.iter().copied())
            .filter(|d| !d.is_empty())
    }

    /// Clears every entry whose offset lies beyond `write_pos` in the current phase; used by
    /// recovery (spec.md §4.8 step 4) to drop entries for writes that did not survive a crash.
    pub fn clear_unreachable(&mut self, is_reachable: impl Fn(&Dir) -> bool) {
        for segment in &mut self.segments {
            let direct_len = segment.direct_len();
            for idx in 0..segment.entries.len() {
                let entry = segment.entries[idx];
                if !entry.is_empty() && !is_reachable(&entry) {
                    segment.entries[idx] = Dir::default();
                    if is_overflow(idx as u32, direct_len) {
                        segment.free_overflow.push(idx as u32);
                    }
                }
            }
        }
    }
}

impl Dir {
    fn set_next(&mut self, next: Option<u32>) {
        self.next = next;
    }
}

fn is_overflow(idx: u32, direct_len: usize) -> bool {
    idx as usize >= direct_len
}

fn advance_within_bucket(base: usize, current: u32) -> Option<u32> {
    let offset_in_bucket = current as usize - base;
    if offset_in_bucket + 1 < DIR_DEPTH {
        Some((base + offset_in_bucket + 1) as u32)
    } else {
        None
    }
}

fn current_unix_time() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// True iff `dir.offset` points to a region that has already been written in the current phase,
/// i.e. is not beyond the volume's `write_pos` (spec.md §4.4 `dir_valid`).
#[must_use]
pub fn dir_valid(dir: &Dir, phase: bool, offset_cache_blocks: u64, write_pos_cache_blocks: u64) -> bool {
    if dir.phase != phase {
        // A stale-phase entry is only valid if it lies ahead of the write pointer (not yet
        // overwritten by the new phase's pass).
        return offset_cache_blocks >= write_pos_cache_blocks;
    }
    offset_cache_blocks < write_pos_cache_blocks
}

/// True iff `dir.offset` points inside the aggregation buffer rather than durably on disk
/// (spec.md §4.4 `dir_agg_buf_valid`).
#[must_use]
pub fn dir_agg_buf_valid(offset_cache_blocks: u64, write_pos_cache_blocks: u64, agg_pos_cache_blocks: u64) -> bool {
    offset_cache_blocks >= write_pos_cache_blocks && offset_cache_blocks < agg_pos_cache_blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: u32, seg: u64, bucket: u64) -> CacheKey {
        CacheKey::from_words([seg as u32, bucket as u32, tag, 0])
    }

    #[test]
    fn insert_then_probe_finds_entry() {
        let mut dir = Directory::new(2, 4);
        let k = key(0xAAAA, 0, 0);
        let idx = dir.insert(&k, Dir { offset: 10, approx_size: 5, tag: 0, phase: false, head: true, pinned: 0, next: None }).unwrap();
        let (found_idx, found) = dir.probe(&k, None).unwrap();
        assert_eq!(found_idx, idx);
        assert_eq!(found.offset, 10);
    }

    #[test]
    fn probe_misses_unknown_key() {
        let dir = Directory::new(2, 4);
        let k = key(0x1234, 0, 0);
        assert!(dir.probe(&k, None).is_none());
    }

    #[test]
    fn collision_same_bucket_different_tag_both_found() {
        let mut dir = Directory::new(1, 1);
        let k1 = key(0x1111, 0, 0);
        let k2 = key(0x2222, 0, 0);
        dir.insert(&k1, Dir { offset: 1, approx_size: 1, tag: 0, phase: false, head: true, pinned: 0, next: None }).unwrap();
        dir.insert(&k2, Dir { offset: 2, approx_size: 1, tag: 0, phase: false, head: true, pinned: 0, next: None }).unwrap();

        let (_, e1) = dir.probe(&k1, None).unwrap();
        let (_, e2) = dir.probe(&k2, None).unwrap();
        assert_eq!(e1.offset, 1);
        assert_eq!(e2.offset, 2);
    }

    #[test]
    fn overflow_chains_past_dir_depth() {
        let mut dir = Directory::new(1, 1);
        let k = key(0xABCD, 0, 0);
        // Fill all DIR_DEPTH direct slots plus one overflow entry, all colliding in bucket 0.
        let mut last_idx = 0;
        for i in 0..(DIR_DEPTH as u64 + 1) {
            let collider = key(0xABCD, 0, 0);
            last_idx = dir
                .insert(&collider, Dir { offset: i + 1, approx_size: 1, tag: 0, phase: false, head: false, pinned: 0, next: None })
                .unwrap();
        }
        let _ = k;
        assert!(last_idx as usize >= DIR_DEPTH);
    }

    #[test]
    fn delete_clears_entry_and_relinks() {
        let mut dir = Directory::new(1, 1);
        let k = key(0x1, 0, 0);
        let idx = dir.insert(&k, Dir { offset: 42, approx_size: 1, tag: 0, phase: false, head: true, pinned: 0, next: None }).unwrap();
        dir.delete_at(&k, idx);
        assert!(dir.probe(&k, None).is_none());
    }

    #[test]
    fn dir_valid_checks_against_write_pos() {
        let entry = Dir { offset: 5, approx_size: 1, tag: 0, phase: true, head: true, pinned: 0, next: None };
        assert!(dir_valid(&entry, true, 5, 10));
        assert!(!dir_valid(&entry, true, 15, 10));
    }
}
