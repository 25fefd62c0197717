//! Recovery (spec.md §4.8): reconciles a volume's on-disk header/footer and directory after an
//! unclean shutdown.
//!
//! The header (start of the volume's extent) and footer (end of the directory region) are written
//! together on every `dir_sync`, but only the footer's fsync is the durability barrier for a write
//! that just completed; a crash between the data write and the footer sync leaves the header ahead
//! of the footer. Recovery trusts whichever one is both valid and behind, then replays forward from
//! there.

use std::sync::Arc;

use snafu::Snafu;
use tracing::instrument;

use crate::{
    config::RECOVERY_SIZE,
    directory::Dir,
    doc::{DocHeader, DOC_HEADER_LEN},
    io::AioBridge,
    volume::{header::VolHeaderFooter, Volume},
};

#[derive(Debug, Snafu)]
pub enum RecoveryError {
    #[snafu(display("neither header nor footer is a valid volume record"))]
    NoValidRecord,

    #[snafu(display("recovery I/O error: {source}"))]
    Io { source: std::io::Error },
}

impl From<std::io::Error> for RecoveryError {
    fn from(source: std::io::Error) -> Self {
        RecoveryError::Io { source }
    }
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub trusted_write_pos: u64,
    pub fragments_replayed: usize,
    pub fragments_dropped: usize,
    pub used_footer: bool,
}

/// Picks the trusted record between `header` and `footer`: whichever is valid; if both are valid
/// and they disagree, the one with the lower `write_serial` is behind and therefore trustworthy
/// (the other reflects a write whose footer sync never landed).
#[must_use]
fn select_trusted(header: VolHeaderFooter, footer: VolHeaderFooter) -> Option<(VolHeaderFooter, bool)> {
    match (header.is_valid(), footer.is_valid()) {
        (true, true) => {
            if header.agrees_with(&footer) {
                Some((header, false))
            } else if footer.write_serial <= header.write_serial {
                Some((footer, true))
            } else {
                Some((header, false))
            }
        }
        (true, false) => Some((header, false)),
        (false, true) => Some((footer, true)),
        (false, false) => None,
    }
}

/// Runs recovery for `volume`: selects the trusted header/footer record, then scans *forward* from
/// its `write_pos` (spec.md §4.8 step 3) for fragments that were written and durably flushed after
/// the trusted record was taken but whose directory entries never made it into that snapshot. A
/// fragment belongs to this replay only if its `sync_serial` matches the trusted record's -- a
/// lower `sync_serial` means it predates the trusted snapshot (already accounted for), and the scan
/// stops at the first mismatch, invalid magic, or decode failure, since that marks either
/// unwritten space or a write that never completed. The final scan position becomes the volume's
/// recovered `write_pos`, overriding the trusted record's stale one.
///
/// # Errors
///
/// Returns [`RecoveryError::NoValidRecord`] if neither the header nor the footer validates, which
/// means the volume must be reinitialized rather than recovered.
#[instrument(skip(volume, file, header, footer), fields(volume = volume.number()))]
pub async fn recover_volume(
    volume: &Volume,
    file: Arc<std::fs::File>,
    header: VolHeaderFooter,
    footer: VolHeaderFooter,
) -> Result<RecoveryReport, RecoveryError> {
    let (mut trusted, used_footer) = select_trusted(header, footer).ok_or(RecoveryError::NoValidRecord)?;
    info!(volume = volume.number(), write_pos = trusted.write_pos, used_footer, "selected trusted volume record");
    volume.set_header(trusted);

    let scan_limit = trusted.write_pos * crate::config::CACHE_BLOCK_SIZE + RECOVERY_SIZE;
    let aio = volume.aio().clone();

    let mut cursor = trusted.write_pos * crate::config::CACHE_BLOCK_SIZE;
    let mut fragments_replayed = 0usize;
    while cursor + DOC_HEADER_LEN as u64 <= scan_limit {
        let absolute = volume.data_base() + cursor;
        let header_bytes = match aio.read_at(file.clone(), absolute, DOC_HEADER_LEN).await {
            Ok(bytes) => bytes,
            Err(_) => break,
        };
        let Some(doc_header) = DocHeader::decode(header_bytes) else {
            break;
        };
        if doc_header.magic != crate::doc::DOC_MAGIC || doc_header.len == 0 {
            break;
        }
        if doc_header.sync_serial != trusted.sync_serial {
            debug!(cursor, found = doc_header.sync_serial, trusted = trusted.sync_serial, "stopping forward scan at sync_serial mismatch");
            break;
        }

        let dir = Dir::new(
            cursor / crate::config::CACHE_BLOCK_SIZE,
            doc_header.len,
            trusted.phase,
            true,
            doc_header.pinned,
        );
        if volume.directory().write().insert(&doc_header.key, dir).is_ok() {
            fragments_replayed += 1;
        }

        cursor += crate::doc::padded_len(doc_header.len);
    }

    trusted.write_pos = cursor / crate::config::CACHE_BLOCK_SIZE;
    volume.set_header(trusted);

    let fragments_dropped = drop_unreachable(volume, trusted);
    info!(volume = volume.number(), write_pos = trusted.write_pos, fragments_replayed, fragments_dropped, "recovery complete");

    Ok(RecoveryReport {
        trusted_write_pos: trusted.write_pos,
        fragments_replayed,
        fragments_dropped,
        used_footer,
    })
}

/// Clears every directory entry in the current phase that points at or beyond the trusted write
/// pointer: those fragments were being written when the process stopped and cannot be assumed
/// complete.
fn drop_unreachable(volume: &Volume, trusted: VolHeaderFooter) -> usize {
    let before = volume.directory().read().iter_occupied().count();
    volume.directory().write().clear_unreachable(|dir| {
        if dir.phase == trusted.phase {
            dir.offset < trusted.write_pos
        } else {
            true
        }
    });
    let after = volume.directory().read().iter_occupied().count();
    before - after
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(write_pos: u64, write_serial: u32) -> VolHeaderFooter {
        let mut h = VolHeaderFooter::new(1, 0);
        h.write_pos = write_pos;
        h.write_serial = write_serial;
        h
    }

    #[test]
    fn trusts_agreeing_header_and_footer() {
        let h = header(10, 1);
        let (trusted, used_footer) = select_trusted(h, h).unwrap();
        assert_eq!(trusted.write_pos, 10);
        assert!(!used_footer);
    }

    #[test]
    fn trusts_the_behind_record_on_disagreement() {
        let h = header(20, 2);
        let f = header(10, 1);
        let (trusted, used_footer) = select_trusted(h, f).unwrap();
        assert_eq!(trusted.write_pos, 10);
        assert!(used_footer);
    }

    #[test]
    fn falls_back_to_whichever_is_valid() {
        let mut h = header(5, 1);
        h.magic = 0;
        let f = header(3, 1);
        let (trusted, used_footer) = select_trusted(h, f).unwrap();
        assert_eq!(trusted.write_pos, 3);
        assert!(used_footer);
    }

    #[test]
    fn neither_valid_is_an_error() {
        let mut h = header(5, 1);
        h.magic = 0;
        let mut f = header(3, 1);
        f.magic = 0;
        assert!(select_trusted(h, f).is_none());
    }
}
