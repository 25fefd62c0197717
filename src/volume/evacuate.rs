//! Evacuator (spec.md §4.7): relocates fragments the write cursor is about to overwrite so they
//! survive the stripe's wraparound, and tracks them in a lookaside index until the directory catches
//! up.

use std::collections::HashMap;

use crate::{config::LOOKASIDE_SIZE, directory::Dir, key::CacheKey};

/// A pending relocation: a fragment read from its old location, waiting to be re-written ahead of
/// the write cursor and re-inserted into the directory at its new offset.
#[derive(Clone, Debug)]
pub struct EvacuationCandidate {
    pub key: CacheKey,
    pub old_dir: Dir,
}

/// Tracks fragments within [`crate::config::EVACUATION_SIZE`] of the write cursor that must be
/// copied forward before they are overwritten, plus a small side index so a concurrent reader that
/// looks up a key mid-evacuation still finds it (spec.md §4.7: "readers consult the lookaside index
/// before falling through to a miss").
#[derive(Debug, Default)]
pub struct Evacuator {
    pending: Vec<EvacuationCandidate>,
    /// Bounded by [`LOOKASIDE_SIZE`]; once full, the oldest completed relocation is evicted, which
    /// is safe because by then the directory has already been updated with the new location.
    lookaside: HashMap<CacheKey, Dir>,
    lookaside_order: Vec<CacheKey>,
}

impl Evacuator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a fragment for relocation. Called when the write cursor's forward scan finds a live,
    /// unpinned-for-eviction entry inside the evacuation window.
    pub fn queue(&mut self, key: CacheKey, old_dir: Dir) {
        trace!(key = %key, offset = old_dir.offset, "queued fragment for evacuation");
        self.pending.push(EvacuationCandidate { key, old_dir });
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn take_pending(&mut self) -> Vec<EvacuationCandidate> {
        std::mem::take(&mut self.pending)
    }

    /// Records a fragment's new location once it has been re-written ahead of the cursor, making it
    /// visible to readers before the bulk directory update lands.
    pub fn mark_relocated(&mut self, key: CacheKey, new_dir: Dir) {
        debug!(key = %key, new_offset = new_dir.offset, "fragment relocated ahead of write cursor");
        if self.lookaside.insert(key, new_dir).is_none() {
            self.lookaside_order.push(key);
            if self.lookaside_order.len() > LOOKASIDE_SIZE {
                let evicted = self.lookaside_order.remove(0);
                self.lookaside.remove(&evicted);
            }
        }
    }

    /// Looks up a key that may have been relocated but not yet reflected by a directory scan.
    #[must_use]
    pub fn lookaside(&self, key: &CacheKey) -> Option<Dir> {
        self.lookaside.get(key).copied()
    }

    /// Clears an entry once the caller has folded it into the main directory, so the lookaside
    /// index only ever holds the gap between relocation and directory update.
    pub fn clear_lookaside(&mut self, key: &CacheKey) {
        if self.lookaside.remove(key).is_some() {
            self.lookaside_order.retain(|k| k != key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(offset: u64) -> Dir {
        Dir { offset, approx_size: 1, tag: 0, phase: false, head: true, pinned: 0, ..Default::default() }
    }

    fn key(n: u32) -> CacheKey {
        CacheKey::from_words([n, n, n, n])
    }

    #[test]
    fn queue_and_drain_pending() {
        let mut evac = Evacuator::new();
        evac.queue(key(1), dir(10));
        assert_eq!(evac.pending_count(), 1);
        let drained = evac.take_pending();
        assert_eq!(drained.len(), 1);
        assert_eq!(evac.pending_count(), 0);
    }

    #[test]
    fn lookaside_finds_relocated_entry_until_cleared() {
        let mut evac = Evacuator::new();
        let k = key(2);
        evac.mark_relocated(k, dir(99));
        assert_eq!(evac.lookaside(&k).unwrap().offset, 99);
        evac.clear_lookaside(&k);
        assert!(evac.lookaside(&k).is_none());
    }

    #[test]
    fn lookaside_bounded_by_configured_size() {
        let mut evac = Evacuator::new();
        for i in 0..(LOOKASIDE_SIZE as u32 + 5) {
            evac.mark_relocated(key(i), dir(u64::from(i)));
        }
        assert!(evac.lookaside_order.len() <= LOOKASIDE_SIZE);
    }
}
