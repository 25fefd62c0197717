//! On-disk fragment framing (spec.md §4.5, §6).
//!
//! A `Doc` is `[header | alternates (hlen bytes) | payload]`, zero-padded so the next `Doc` starts
//! on a cache-block boundary. Unlike the teacher crate's `rkyv`-archived [`Record`], the wire
//! format here is a fixed, explicitly little-endian struct (spec.md §6 nails down every field and
//! byte order), so framing is done by hand with `to_le_bytes`/`from_le_bytes` rather than zero-copy
//! deserialization -- there is no stable, portable zero-copy representation that also satisfies
//! "little-endian on disk" independent of host endianness.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;

use crate::{config::round_to_cache_block, key::CacheKey};

pub const DOC_MAGIC: u32 = 0x5F12_9B13;
/// Sentinel magic written over a fragment's header once it is known to be corrupt, so a later
/// reader can distinguish "never written" from "written, then invalidated".
pub const DOC_CORRUPT: u32 = 0xDEAD_BEEF;
pub const DOC_NO_CHECKSUM: u32 = 0xFFFF_FFFF;

pub const CURRENT_MAJOR_VERSION: u8 = 24;
pub const CURRENT_MINOR_VERSION: u8 = 2;

/// Fixed-size on-disk header preceding every fragment's alternates and payload.
#[derive(Clone, Copy, Debug)]
pub struct DocHeader {
    pub magic: u32,
    /// Total length of this fragment, header + alternates + payload, unrounded.
    pub len: u32,
    /// Total length of the logical object across all of its fragments.
    pub total_len: u64,
    pub first_key: CacheKey,
    pub key: CacheKey,
    pub hlen: u32,
    pub doc_type: u8,
    pub v_major: u8,
    pub v_minor: u8,
    pub sync_serial: u32,
    pub write_serial: u32,
    /// Wall-clock deadline (unix seconds) this fragment is pinned against eviction until, or 0.
    pub pinned: u32,
    pub checksum: u32,
}

/// Size of [`DocHeader`]'s on-disk encoding, in bytes.
pub const DOC_HEADER_LEN: usize = 4 + 4 + 8 + 16 + 16 + 4 + 1 + 1 + 1 + 1 + 4 + 4 + 4 + 4;

impl DocHeader {
    #[must_use]
    pub fn data_len(&self) -> u32 {
        self.len - DOC_HEADER_LEN as u32 - self.hlen
    }

    #[must_use]
    pub fn prefix_len(&self) -> u32 {
        DOC_HEADER_LEN as u32 + self.hlen
    }

    /// A fragment is valid iff its magic matches, its version is not newer than this build
    /// supports, and (when enabled) its checksum matches the recomputed value over the bytes
    /// following the header.
    #[must_use]
    pub fn is_valid(&self, checksum_enabled: bool, body: &[u8]) -> bool {
        if self.magic != DOC_MAGIC {
            return false;
        }
        if self.is_future_version() {
            return false;
        }
        if checksum_enabled && self.checksum != DOC_NO_CHECKSUM {
            return self.checksum == compute_checksum(body);
        }
        true
    }

    #[must_use]
    pub fn is_future_version(&self) -> bool {
        self.v_major > CURRENT_MAJOR_VERSION
    }

    /// A minor version below the current build triggers the legacy unmarshal routine rather than
    /// being treated as corrupt (spec.md §6 versioning rules).
    #[must_use]
    pub fn needs_migration_read(&self) -> bool {
        self.v_major == CURRENT_MAJOR_VERSION && self.v_minor < CURRENT_MINOR_VERSION
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.magic);
        out.put_u32_le(self.len);
        out.put_u64_le(self.total_len);
        for word in self.first_key.words() {
            out.put_u32_le(word);
        }
        for word in self.key.words() {
            out.put_u32_le(word);
        }
        out.put_u32_le(self.hlen);
        out.put_u8(self.doc_type);
        out.put_u8(self.v_major);
        out.put_u8(self.v_minor);
        out.put_u8(0); // unused/padding byte, per spec.md §6 wire layout
        out.put_u32_le(self.sync_serial);
        out.put_u32_le(self.write_serial);
        out.put_u32_le(self.pinned);
        out.put_u32_le(self.checksum);
    }

    #[must_use]
    pub fn decode(mut buf: Bytes) -> Option<Self> {
        if buf.len() < DOC_HEADER_LEN {
            return None;
        }
        let magic = buf.get_u32_le();
        let len = buf.get_u32_le();
        let total_len = buf.get_u64_le();
        let first_key = CacheKey::from_words([
            buf.get_u32_le(),
            buf.get_u32_le(),
            buf.get_u32_le(),
            buf.get_u32_le(),
        ]);
        let key = CacheKey::from_words([
            buf.get_u32_le(),
            buf.get_u32_le(),
            buf.get_u32_le(),
            buf.get_u32_le(),
        ]);
        let hlen = buf.get_u32_le();
        let doc_type = buf.get_u8();
        let v_major = buf.get_u8();
        let v_minor = buf.get_u8();
        let _unused = buf.get_u8();
        let sync_serial = buf.get_u32_le();
        let write_serial = buf.get_u32_le();
        let pinned = buf.get_u32_le();
        let checksum = buf.get_u32_le();

        Some(Self {
            magic,
            len,
            total_len,
            first_key,
            key,
            hlen,
            doc_type,
            v_major,
            v_minor,
            sync_serial,
            write_serial,
            pinned,
            checksum,
        })
    }
}

/// Checksum over `[header end, header end + len)`: a plain CRC32 of the alternates + payload
/// bytes, recomputed and compared against `DocHeader::checksum` on read.
#[must_use]
pub fn compute_checksum(body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

/// One negotiated HTTP response variant descriptor, serialized into a `Doc`'s alternates area.
///
/// This is the only piece of "HTTP" the engine understands: the boundary structure it persists
/// and later selects from, not general request/response parsing (spec.md §1 keeps that external).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AlternateDescriptor {
    pub content_encoding: String,
    pub content_language: String,
    pub size: u64,
}

/// Serialized form of the alternates vector living in a `Doc`'s `hlen`-byte region.
#[derive(Clone, Debug, Default)]
pub struct AlternateVec {
    pub alternates: Vec<AlternateDescriptor>,
}

impl AlternateVec {
    /// Selects the best matching alternate for a request's accepted encodings/languages. Returns
    /// `None` when nothing satisfies the request, which the caller surfaces as
    /// [`crate::error::CacheError::AltMiss`].
    #[must_use]
    pub fn select(&self, accept_encoding: &str, accept_language: &str) -> Option<&AlternateDescriptor> {
        self.alternates.iter().find(|alt| {
            (accept_encoding.is_empty() || alt.content_encoding == accept_encoding)
                && (accept_language.is_empty() || alt.content_language == accept_language)
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.alternates.len() as u32);
        for alt in &self.alternates {
            put_len_prefixed(out, alt.content_encoding.as_bytes());
            put_len_prefixed(out, alt.content_language.as_bytes());
            out.put_u64_le(alt.size);
        }
    }

    /// Unmarshal routine for the current on-disk version. Per spec.md §4.5, an older persisted
    /// format is unmarshalled through a different routine selected by the `Doc`'s stored version;
    /// see [`AlternateVec::decode_legacy`].
    #[must_use]
    pub fn decode(mut buf: Bytes) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let count = buf.get_u32_le() as usize;
        let mut alternates = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let content_encoding = get_len_prefixed_string(&mut buf)?;
            let content_language = get_len_prefixed_string(&mut buf)?;
            if buf.remaining() < 8 {
                return None;
            }
            let size = buf.get_u64_le();
            alternates.push(AlternateDescriptor {
                content_encoding,
                content_language,
                size,
            });
        }
        Some(Self { alternates })
    }

    /// Legacy (pre-`CURRENT_MINOR_VERSION`) unmarshal routine: the original format stored only a
    /// single, unlabeled alternate with no encoding/language discriminators.
    #[must_use]
    pub fn decode_legacy(mut buf: Bytes) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }
        let size = buf.get_u64_le();
        Some(Self {
            alternates: vec![AlternateDescriptor {
                content_encoding: String::new(),
                content_language: String::new(),
                size,
            }],
        })
    }
}

fn put_len_prefixed(out: &mut BytesMut, bytes: &[u8]) {
    out.put_u16_le(bytes.len() as u16);
    out.put_slice(bytes);
}

fn get_len_prefixed_string(buf: &mut Bytes) -> Option<String> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).ok()
}

/// Rounds a fragment's total on-disk footprint up to the next cache-block boundary so the next
/// `Doc` starts aligned.
#[must_use]
pub fn padded_len(len: u32) -> u64 {
    round_to_cache_block(u64::from(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> DocHeader {
        DocHeader {
            magic: DOC_MAGIC,
            len: 128,
            total_len: 128,
            first_key: CacheKey::from_words([1, 2, 3, 4]),
            key: CacheKey::from_words([1, 2, 3, 4]),
            hlen: 0,
            doc_type: 1,
            v_major: CURRENT_MAJOR_VERSION,
            v_minor: CURRENT_MINOR_VERSION,
            sync_serial: 1,
            write_serial: 1,
            pinned: 0,
            checksum: DOC_NO_CHECKSUM,
        }
    }

    #[test]
    fn header_roundtrips_through_encode_decode() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), DOC_HEADER_LEN);

        let decoded = DocHeader::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.magic, header.magic);
        assert_eq!(decoded.key, header.key);
        assert_eq!(decoded.total_len, header.total_len);
    }

    #[test]
    fn future_version_is_invalid() {
        let mut header = sample_header();
        header.v_major = CURRENT_MAJOR_VERSION + 1;
        assert!(!header.is_valid(true, b"payload"));
    }

    #[test]
    fn checksum_mismatch_is_invalid() {
        let mut header = sample_header();
        header.checksum = compute_checksum(b"original");
        assert!(!header.is_valid(true, b"tampered"));
        assert!(header.is_valid(true, b"original"));
    }

    #[test]
    fn checksum_disabled_short_circuits_validation() {
        let mut header = sample_header();
        header.checksum = compute_checksum(b"original");
        assert!(header.is_valid(false, b"tampered"));
    }

    #[test]
    fn alternates_roundtrip_and_select() {
        let vec = AlternateVec {
            alternates: vec![
                AlternateDescriptor {
                    content_encoding: "gzip".into(),
                    content_language: "en".into(),
                    size: 100,
                },
                AlternateDescriptor {
                    content_encoding: "identity".into(),
                    content_language: "en".into(),
                    size: 200,
                },
            ],
        };
        let mut buf = BytesMut::new();
        vec.encode(&mut buf);
        let decoded = AlternateVec::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.alternates.len(), 2);

        let selected = decoded.select("gzip", "en").unwrap();
        assert_eq!(selected.size, 100);
        assert!(decoded.select("br", "en").is_none());
    }
}
