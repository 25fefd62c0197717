//! Content-addressed cache keys.

use std::fmt;

use crc32fast::Hasher;

/// A 128-bit content hash identifying a cached object.
///
/// The four 32-bit words making up a [`CacheKey`] each have a distinct role in the engine, per
/// the original cache's convention:
///
/// - word 0 selects the owning [`crate::volume::Volume`] (via the global hash table) and, within
///   a volume, the directory segment.
/// - word 1 selects the directory bucket within the segment.
/// - word 2 supplies the in-bucket disambiguation tag.
/// - word 3 is reserved for RAM cache hashing and the evacuator's lookaside index.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct CacheKey([u32; 4]);

impl CacheKey {
    pub const ZERO: CacheKey = CacheKey([0; 4]);

    #[must_use]
    pub fn from_words(words: [u32; 4]) -> Self {
        Self(words)
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(bytes);
        let base = hasher.finalize();

        // Derive four distinct but related words from the byte slice so that short inputs still
        // spread across the full 128 bits. This is not a cryptographic hash; callers needing
        // collision resistance should build their `CacheKey` from a real 128-bit digest via
        // `from_words` instead.
        let mut hasher1 = Hasher::new();
        hasher1.update(bytes);
        hasher1.update(&[0xA5]);
        let w1 = hasher1.finalize();

        let mut hasher2 = Hasher::new();
        hasher2.update(bytes);
        hasher2.update(&[0x5A]);
        let w2 = hasher2.finalize();

        let mut hasher3 = Hasher::new();
        hasher3.update(bytes);
        hasher3.update(&[0xFF, 0x00]);
        let w3 = hasher3.finalize();

        Self([base, w1, w2, w3])
    }

    /// Returns word `n` (0..=3) of the key, per the role table in the struct docs.
    #[must_use]
    pub fn slice32(&self, n: usize) -> u32 {
        self.0[n]
    }

    /// 64-bit combination of words `2n` and `2n+1`, used for modulo-based bucket/segment
    /// selection where a wider domain reduces clustering.
    #[must_use]
    pub fn slice64(&self, n: usize) -> u64 {
        let hi = u64::from(self.0[2 * n]);
        let lo = u64::from(self.0[2 * n + 1]);
        (hi << 32) | lo
    }

    #[must_use]
    pub fn words(&self) -> [u32; 4] {
        self.0
    }

    /// High bits of the key used as the directory entry's in-bucket disambiguation tag.
    ///
    /// The tag is deliberately narrower than the full key: directory entries are small, fixed-size
    /// records, so only enough bits to make same-bucket collisions rare (not impossible) are
    /// retained. A tag match is necessary, but not sufficient, for two keys to be treated as equal
    /// -- the full key is not recoverable from the tag alone.
    #[must_use]
    pub fn tag(&self) -> u32 {
        self.0[2]
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheKey({:08x}{:08x}{:08x}{:08x})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The content class a key belongs to, threaded through every external operation.
///
/// Dropped from the distilled module list but present on every signature in the external
/// interfaces section; kept here as a small, explicit enum rather than an opaque integer.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum CacheFragType {
    /// Used only for the empty/sentinel fragment type.
    None,
    Http,
    Generic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice32_roundtrips_words() {
        let key = CacheKey::from_words([1, 2, 3, 4]);
        assert_eq!(key.slice32(0), 1);
        assert_eq!(key.slice32(3), 4);
    }

    #[test]
    fn slice64_combines_adjacent_words() {
        let key = CacheKey::from_words([0, 0, 0x1234_5678, 0x9abc_def0]);
        assert_eq!(key.slice64(1), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn tag_is_word_two() {
        let key = CacheKey::from_words([0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(key.tag(), 0xCC);
    }

    #[test]
    fn from_bytes_is_deterministic() {
        let a = CacheKey::from_bytes(b"/index.html");
        let b = CacheKey::from_bytes(b"/index.html");
        assert_eq!(a, b);
    }

    #[test]
    fn from_bytes_distinguishes_inputs() {
        let a = CacheKey::from_bytes(b"/index.html");
        let b = CacheKey::from_bytes(b"/other.html");
        assert_ne!(a, b);
    }
}
