//! Cache VC (spec.md §4.10): the per-request state machine driving one read or write against a
//! volume. Named after the original cache's "virtual connection"; here it is a plain async task
//! rather than a continuation-passing state machine, since `async fn` gives the same suspend/resume
//! shape natively.

use std::sync::{atomic::{AtomicBool, Ordering}, Arc};

use bytes::Bytes;
use tracing::instrument;

use crate::{
    directory::Dir,
    doc::{AlternateVec, DocHeader, DOC_HEADER_LEN},
    error::CacheError,
    key::{CacheFragType, CacheKey},
    volume::{Volume, VolumeError},
};

/// Handed back to a caller so it can cancel an in-flight read or write (spec.md §4.10
/// "reenable/cancel semantics"). Checked between every awaited I/O step.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Successful result of a read VC: the selected alternate's payload plus the header metadata a
/// caller needs to answer conditional/range requests.
#[derive(Debug)]
pub struct ReadResult {
    pub header: DocHeader,
    pub payload: Bytes,
}

/// Drives one read against a volume: directory lookup, header fetch and validation, alternate
/// selection, then the body fetch. Each step checks the [`CancelToken`] before issuing I/O so a
/// canceled request doesn't pay for work nobody wants anymore.
pub struct ReadVC {
    pub key: CacheKey,
    pub frag_type: CacheFragType,
    pub accept_encoding: String,
    pub accept_language: String,
    volume: Arc<Volume>,
    file: Arc<std::fs::File>,
    cancel: CancelToken,
}

impl ReadVC {
    #[must_use]
    pub fn new(
        key: CacheKey,
        frag_type: CacheFragType,
        volume: Arc<Volume>,
        file: Arc<std::fs::File>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            key,
            frag_type,
            accept_encoding: String::new(),
            accept_language: String::new(),
            volume,
            file,
            cancel,
        }
    }

    /// Runs the VC to completion.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Canceled`] if [`CancelToken::cancel`] was called before completion.
    /// - [`CacheError::NoDoc`] if the key is not present in the volume's directory.
    /// - [`CacheError::CorruptData`] if the header's magic/version/checksum fails validation.
    /// - [`CacheError::AltMiss`] if no alternate matches the requested encoding/language.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn run(mut self) -> Result<ReadResult, CacheError> {
        self.check_canceled()?;
        let dir = self.volume.lookup(&self.key).ok_or_else(|| {
            trace!(key = %self.key, "read miss: no directory entry");
            CacheError::NoDoc
        })?;

        self.check_canceled()?;
        let (header, body) = self.fetch_fragment(&dir).await?;

        self.check_canceled()?;
        let alternates = AlternateVec::decode(body.clone()).unwrap_or_default();
        let _selected = if self.frag_type == CacheFragType::Http && !alternates.alternates.is_empty() {
            alternates.select(&self.accept_encoding, &self.accept_language).ok_or_else(|| {
                debug!(key = %self.key, "no alternate satisfies accept headers");
                CacheError::AltMiss
            })?
        } else {
            return Ok(ReadResult { header, payload: body.slice(header.hlen as usize..) });
        };

        Ok(ReadResult { header, payload: body.slice(header.hlen as usize..) })
    }

    #[instrument(skip(self, dir), fields(key = %self.key, offset = dir.offset))]
    async fn fetch_fragment(&mut self, dir: &Dir) -> Result<(DocHeader, Bytes), CacheError> {
        let offset = dir.offset * crate::config::CACHE_BLOCK_SIZE + self.volume.data_base();
        let aio = self.volume.aio().clone();
        let header_bytes = aio.read_at(self.file.clone(), offset, DOC_HEADER_LEN).await.map_err(|error| {
            warn!(key = %self.key, %error, "read error fetching fragment header");
            CacheError::ReadError
        })?;
        let header = DocHeader::decode(header_bytes).ok_or_else(|| {
            warn!(key = %self.key, "fragment header failed to decode");
            CacheError::CorruptData
        })?;

        let body_len = header.len as usize - DOC_HEADER_LEN;
        let body = aio
            .read_at(self.file.clone(), offset + DOC_HEADER_LEN as u64, body_len)
            .await
            .map_err(|error| {
                warn!(key = %self.key, %error, "read error fetching fragment body");
                CacheError::ReadError
            })?;

        if !header.is_valid(self.volume.config().checksum_enabled, &body) {
            warn!(key = %self.key, "fragment checksum mismatch");
            return Err(CacheError::CorruptData);
        }

        Ok((header, body))
    }

    fn check_canceled(&self) -> Result<(), CacheError> {
        if self.cancel.is_canceled() {
            Err(CacheError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Drives one write against a volume: stages the fragment into the aggregation buffer (possibly
/// forcing a flush), and returns the directory entry recorded for it.
pub struct WriteVC {
    pub key: CacheKey,
    volume: Arc<Volume>,
    file: Arc<std::fs::File>,
    cancel: CancelToken,
    max_writers: Option<u32>,
}

impl WriteVC {
    #[must_use]
    pub fn new(key: CacheKey, volume: Arc<Volume>, file: Arc<std::fs::File>, cancel: CancelToken) -> Self {
        Self { key, volume, file, cancel, max_writers: None }
    }

    /// Overrides `config.default_max_writers` for this write, per spec.md §4.3's
    /// `open_write(vc, allow_if_writers, max_writers)` contract.
    #[must_use]
    pub fn with_max_writers(mut self, max_writers: Option<u32>) -> Self {
        self.max_writers = max_writers;
        self
    }

    /// # Errors
    ///
    /// - [`CacheError::Canceled`] if canceled before the stage completes.
    /// - [`CacheError::DocBusy`] if the volume's writer-admission policy or cap rejects this write.
    /// - [`CacheError::NoSpace`] for any other staging failure (oversized fragment, directory full,
    ///   I/O error).
    #[instrument(skip(self, header, alternates, payload), fields(key = %self.key))]
    pub async fn run(self, header: &DocHeader, alternates: &[u8], payload: &[u8]) -> Result<Dir, CacheError> {
        if self.cancel.is_canceled() {
            return Err(CacheError::Canceled);
        }
        self.volume
            .write_fragment(self.key, header, alternates, payload, self.file, self.max_writers)
            .await
            .map_err(|error| {
                let mapped = match error {
                    VolumeError::WriterExists => CacheError::DocBusy,
                    _ => CacheError::NoSpace,
                };
                warn!(key = %self.key, %error, mapped = ?mapped, "write rejected");
                mapped
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_reports_cancellation() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
    }
}
