//! Volume header/footer: the on-disk record of a stripe's write position and generation (spec.md
//! §4.3, §6). Both a header (at the front of the volume's extent) and a footer (immediately after
//! the directory) are kept; they agree except immediately after a crash, which is exactly the
//! signal [`crate::recovery`] uses to find where a write was interrupted.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const VOL_HEADER_MAGIC: u32 = 0xF1D0_0D11;

/// Mutable stripe bookkeeping serialized into both the header and footer slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VolHeaderFooter {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub volume_number: i32,
    pub create_time: u64,
    /// Offset, in cache blocks from the start of the volume's data region, of the next write.
    pub write_pos: u64,
    /// Offset of the last byte scanned into the in-memory directory during recovery.
    pub agg_pos: u64,
    pub generation: u32,
    /// Flips on every wrap of the circular log; used to disambiguate stale directory entries left
    /// over from the previous lap (spec.md §4.4 `dir_valid`).
    pub phase: bool,
    pub sync_serial: u32,
    pub write_serial: u32,
    pub dirty: bool,
}

/// Size of [`VolHeaderFooter`]'s on-disk encoding, in bytes.
pub const VOL_HEADER_LEN: usize = 4 + 2 + 2 + 4 + 8 + 8 + 8 + 4 + 1 + 4 + 4 + 1;

impl VolHeaderFooter {
    #[must_use]
    pub fn new(volume_number: i32, create_time: u64) -> Self {
        Self {
            magic: VOL_HEADER_MAGIC,
            version_major: 24,
            version_minor: 2,
            volume_number,
            create_time,
            write_pos: 0,
            agg_pos: 0,
            generation: 0,
            phase: false,
            sync_serial: 0,
            write_serial: 0,
            dirty: false,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == VOL_HEADER_MAGIC
    }

    /// Header and footer agree iff both the write pointer and the serials line up; divergence
    /// means the footer sync that should have followed the last write never landed (spec.md §4.8
    /// step 2).
    #[must_use]
    pub fn agrees_with(&self, footer: &VolHeaderFooter) -> bool {
        self.write_pos == footer.write_pos
            && self.sync_serial == footer.sync_serial
            && self.write_serial == footer.write_serial
            && self.phase == footer.phase
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.magic);
        out.put_u16_le(self.version_major);
        out.put_u16_le(self.version_minor);
        out.put_i32_le(self.volume_number);
        out.put_u64_le(self.create_time);
        out.put_u64_le(self.write_pos);
        out.put_u64_le(self.agg_pos);
        out.put_u32_le(self.generation);
        out.put_u8(u8::from(self.phase));
        out.put_u32_le(self.sync_serial);
        out.put_u32_le(self.write_serial);
        out.put_u8(u8::from(self.dirty));
    }

    #[must_use]
    pub fn decode(mut buf: Bytes) -> Option<Self> {
        if buf.len() < VOL_HEADER_LEN {
            return None;
        }
        Some(Self {
            magic: buf.get_u32_le(),
            version_major: buf.get_u16_le(),
            version_minor: buf.get_u16_le(),
            volume_number: buf.get_i32_le(),
            create_time: buf.get_u64_le(),
            write_pos: buf.get_u64_le(),
            agg_pos: buf.get_u64_le(),
            generation: buf.get_u32_le(),
            phase: buf.get_u8() != 0,
            sync_serial: buf.get_u32_le(),
            write_serial: buf.get_u32_le(),
            dirty: buf.get_u8() != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let mut header = VolHeaderFooter::new(3, 1000);
        header.write_pos = 512;
        header.sync_serial = 7;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), VOL_HEADER_LEN);

        let decoded = VolHeaderFooter::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn agreement_requires_matching_serials() {
        let header = VolHeaderFooter::new(1, 0);
        let mut footer = header;
        assert!(header.agrees_with(&footer));
        footer.sync_serial += 1;
        assert!(!header.agrees_with(&footer));
    }
}
