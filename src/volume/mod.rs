//! Volume ("Stripe"): one circular log region with its own directory, aggregation buffer,
//! evacuator, and open-object table (spec.md §4.3).

pub mod aggregate;
pub mod evacuate;
pub mod header;
pub mod open_object;

pub use crate::config::{VolumeConfig, VolumeConfigBuilder};

use std::sync::{atomic::{AtomicU64, Ordering}, Arc};

use bytes::BytesMut;
use parking_lot::RwLock;
use snafu::Snafu;
use tracing::instrument;

use self::{
    aggregate::{AggregateError, AggregationBuffer},
    evacuate::{EvacuationCandidate, Evacuator},
    header::VolHeaderFooter,
    open_object::{AdmitWriterError, OpenObjectTable},
};
use crate::{
    config::{round_to_cache_block, CACHE_BLOCK_SIZE, EVACUATION_SIZE},
    directory::{dir_valid, Dir, Directory, DirectoryError},
    disk::Disk,
    doc::{compute_checksum, DocHeader, CURRENT_MAJOR_VERSION, CURRENT_MINOR_VERSION, DOC_HEADER_LEN, DOC_MAGIC},
    io::AioBridge,
    key::CacheKey,
    recovery::RecoveryError,
};

/// Space reserved at the very start of a volume's allocated extent for its header and footer
/// copies (one cache block each); fragment data begins just past it (spec.md §4.3, §4.8).
const VOL_META_RESERVED: u64 = 2 * CACHE_BLOCK_SIZE;

#[derive(Debug, Snafu)]
pub enum VolumeError {
    #[snafu(display("directory is full and every candidate entry is pinned"))]
    DirectoryFull,

    #[snafu(display("a writer is already open for this key"))]
    WriterExists,

    #[snafu(display("fragment exceeds the aggregation buffer"))]
    FragmentTooLarge,

    #[snafu(display("no such object"))]
    NoDoc,

    #[snafu(display("volume I/O error: {source}"))]
    Io { source: std::io::Error },
}

impl From<std::io::Error> for VolumeError {
    fn from(source: std::io::Error) -> Self {
        VolumeError::Io { source }
    }
}

impl From<DirectoryError> for VolumeError {
    fn from(_: DirectoryError) -> Self {
        VolumeError::DirectoryFull
    }
}

impl From<AdmitWriterError> for VolumeError {
    fn from(_: AdmitWriterError) -> Self {
        VolumeError::WriterExists
    }
}

impl From<AggregateError> for VolumeError {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::FragmentTooLarge { .. } => VolumeError::FragmentTooLarge,
            AggregateError::Io { source } => VolumeError::Io { source },
        }
    }
}

/// One stripe: a circular log region on a [`Disk`], with an in-memory directory, an aggregation
/// buffer batching writes, an evacuator protecting live data from the advancing write cursor, and
/// the open-object table arbitrating concurrent access.
pub struct Volume {
    config: VolumeConfig,
    disk: Arc<Disk>,
    /// Byte offset, from the start of the disk's extent, of this volume's reserved header/footer
    /// slots (`VOL_META_RESERVED` bytes, starting here).
    meta_base: u64,
    /// Byte offset, from the start of the disk's extent, where this volume's fragment data region
    /// begins -- immediately after its reserved header/footer slots.
    data_base: u64,
    header: RwLock<VolHeaderFooter>,
    directory: RwLock<Directory>,
    agg: RwLock<AggregationBuffer>,
    evacuator: RwLock<Evacuator>,
    open_objects: OpenObjectTable,
    write_pos: AtomicU64,
}

impl Volume {
    /// `extent_base` is the byte offset, from the start of the disk, of this volume's whole
    /// allocated extent (as returned by [`crate::disk::Disk::create_volume`]); the first
    /// [`VOL_META_RESERVED`] bytes of it are reserved for the header/footer copies, and fragment
    /// data begins just past them.
    #[must_use]
    pub fn new(config: VolumeConfig, disk: Arc<Disk>, extent_base: u64, create_time: u64) -> Self {
        let directory = Directory::new(config.segments, config.buckets);
        let mut header = VolHeaderFooter::new(config.number, create_time);
        // Cache-block 0 of the data region is never used: `Dir::is_empty` treats `offset == 0` as
        // an unoccupied slot, so a fragment actually placed there would be unfindable.
        header.write_pos = 1;
        Self {
            header: RwLock::new(header),
            directory: RwLock::new(directory),
            agg: RwLock::new(AggregationBuffer::new()),
            evacuator: RwLock::new(Evacuator::new()),
            open_objects: OpenObjectTable::new(),
            write_pos: AtomicU64::new(CACHE_BLOCK_SIZE),
            config,
            disk,
            meta_base: extent_base,
            data_base: extent_base + VOL_META_RESERVED,
        }
    }

    #[must_use]
    pub fn number(&self) -> i32 {
        self.config.number
    }

    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Bytes available for fragment data, i.e. the volume's configured extent minus the
    /// [`VOL_META_RESERVED`] header/footer slots at its start.
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.config.size_store_blocks * crate::config::STORE_BLOCK_SIZE - VOL_META_RESERVED
    }

    #[must_use]
    pub fn write_pos(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn phase(&self) -> bool {
        self.header.read().phase
    }

    /// Looks up `key`, checking the evacuator's lookaside index first (it may hold a location the
    /// directory scan has not yet folded in), then the directory itself.
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Option<Dir> {
        if let Some(dir) = self.evacuator.read().lookaside(key) {
            return Some(dir);
        }
        let (_, dir) = self.directory.read().probe(key, None)?;
        let phase = self.phase();
        let write_pos_blocks = self.write_pos() / CACHE_BLOCK_SIZE;
        if dir_valid(&dir, phase, dir.offset, write_pos_blocks) || dir.phase != phase {
            Some(dir)
        } else {
            None
        }
    }

    /// Stages a fragment for `key` into the aggregation buffer, flushing first if there is not
    /// enough room. On success, inserts (or replaces) the directory entry and, if the write cursor
    /// is now bearing down on previously-live data, queues it for evacuation. `max_writers`
    /// overrides `config.default_max_writers` for this call, per spec.md §4.3's
    /// `open_write(vc, allow_if_writers, max_writers)` contract.
    ///
    /// # Errors
    ///
    /// See [`VolumeError`] variants; in particular [`VolumeError::WriterExists`] if the volume's
    /// `allow_if_writers` policy, or its writer cap, rejects a concurrent writer for this key.
    #[instrument(skip(self, header, alternates, payload, file), fields(volume = self.config.number))]
    pub async fn write_fragment(
        &self,
        key: CacheKey,
        header: &DocHeader,
        alternates: &[u8],
        payload: &[u8],
        file: Arc<std::fs::File>,
        max_writers: Option<u32>,
    ) -> Result<Dir, VolumeError> {
        self.open_objects.admit_writer(key, &self.config, max_writers)?;
        let result = self.write_fragment_inner(key, header, alternates, payload, file).await;
        self.open_objects.release_writer(&key);
        result
    }

    async fn write_fragment_inner(
        &self,
        key: CacheKey,
        header: &DocHeader,
        alternates: &[u8],
        payload: &[u8],
        file: Arc<std::fs::File>,
    ) -> Result<Dir, VolumeError> {
        let mut encoded = BytesMut::with_capacity(DOC_HEADER_LEN + alternates.len() + payload.len());
        let mut full_header = *header;
        full_header.magic = DOC_MAGIC;
        full_header.v_major = CURRENT_MAJOR_VERSION;
        full_header.v_minor = CURRENT_MINOR_VERSION;
        full_header.hlen = alternates.len() as u32;
        full_header.len = (DOC_HEADER_LEN + alternates.len() + payload.len()) as u32;
        let mut body = Vec::with_capacity(alternates.len() + payload.len());
        body.extend_from_slice(alternates);
        body.extend_from_slice(payload);
        full_header.checksum = compute_checksum(&body);

        {
            let snapshot = self.header_snapshot();
            full_header.sync_serial = snapshot.sync_serial;
            full_header.write_serial = snapshot.write_serial;
        }

        full_header.encode(&mut encoded);
        encoded.extend_from_slice(&body);

        if round_to_cache_block(encoded.len() as u64) as usize > self.agg.read().remaining_capacity() {
            self.flush_aggregate(file.clone()).await?;
        }

        let phase = self.phase();
        let staged = {
            let mut agg = self.agg.write();
            agg.stage(key, &encoded)?
        };

        let dir = Dir::new(
            (self.write_pos() + staged.buffer_offset) / CACHE_BLOCK_SIZE,
            round_to_cache_block(encoded.len() as u64) as u32,
            phase,
            true,
            full_header.pinned,
        );
        let _idx = self.directory.write().insert(&key, dir)?;
        trace!(key = %key, offset = dir.offset, len = encoded.len(), "staged fragment");

        if self.agg.read().should_flush() {
            self.flush_aggregate(file).await?;
        }

        Ok(dir)
    }

    /// Flushes the aggregation buffer to disk at the current write position, advances the write
    /// cursor, and updates the volume header's bookkeeping. Before the destructive write lands,
    /// scans ahead of the cursor for fragments within [`EVACUATION_SIZE`] that are still reachable
    /// from the directory and relocates them (spec.md §4.3 step 4, §4.7).
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the underlying [`AioBridge`].
    #[instrument(skip(self, file), fields(volume = self.config.number))]
    pub async fn flush_aggregate(&self, file: Arc<std::fs::File>) -> Result<(), VolumeError> {
        if self.agg.read().is_empty() {
            return Ok(());
        }

        self.evacuate_ahead_of_cursor(&file).await?;

        let base_offset = self.data_base + self.write_pos();
        let flushed_len = self.agg.read().len() as u64;
        if flushed_len == 0 {
            return Ok(());
        }
        self.agg.write().flush(self.disk.aio(), file, base_offset).await?;
        self.write_pos.fetch_add(flushed_len, Ordering::AcqRel);

        let mut header = self.header.write();
        header.write_pos = self.write_pos() / CACHE_BLOCK_SIZE;
        header.write_serial += 1;
        debug!(volume = self.config.number, write_pos = header.write_pos, "flushed aggregation buffer");

        self.maybe_wrap(&mut header);
        Ok(())
    }

    /// Scans up to [`EVACUATION_SIZE`] bytes ahead of the write cursor for directory entries the
    /// cursor is about to threaten, queues them, then relocates each one by reading its current
    /// fragment off disk and re-staging it into this flush's aggregation buffer (spec.md §4.7).
    ///
    /// This is a single-pass scan bounded by the window it started with: a relocation that itself
    /// grows the buffer past the original window is not rescanned for further collisions in the
    /// same call, since `EVACUATION_SIZE` is sized to give a fragment multiple flushes of lead time
    /// before the cursor actually reaches it.
    async fn evacuate_ahead_of_cursor(&self, file: &Arc<std::fs::File>) -> Result<(), VolumeError> {
        self.scan_for_evacuation(file, EVACUATION_SIZE).await?;
        let pending = self.drain_pending_evacuations();
        if pending.is_empty() {
            return Ok(());
        }
        debug!(volume = self.config.number, count = pending.len(), "evacuating fragments ahead of write cursor");
        for candidate in pending {
            if let Err(error) = self.relocate_fragment(file, candidate.key, candidate.old_dir).await {
                warn!(key = %candidate.key, %error, "failed to evacuate fragment; it may be overwritten");
            }
        }
        Ok(())
    }

    /// Walks on-disk fragment headers in `[write_pos, write_pos + window)`, queuing any entry the
    /// directory still considers live and that [`Volume::needs_evacuation`] flags as within range.
    /// Stops early at the first header that doesn't decode or doesn't match a live directory entry,
    /// since that marks either unwritten space or data already superseded.
    async fn scan_for_evacuation(&self, file: &Arc<std::fs::File>, window: u64) -> Result<(), VolumeError> {
        let aio = self.aio().clone();
        let capacity = self.capacity_bytes();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let mut scanned = 0u64;
        while scanned < window {
            let region_offset = (self.write_pos() + scanned) % capacity;
            let absolute = self.data_base + region_offset;
            let header_bytes = match aio.read_at(file.clone(), absolute, DOC_HEADER_LEN).await {
                Ok(bytes) => bytes,
                Err(_) => break,
            };
            let Some(doc_header) = DocHeader::decode(header_bytes) else { break };
            if doc_header.magic != DOC_MAGIC || doc_header.len == 0 {
                break;
            }

            let dir_offset_blocks = region_offset / CACHE_BLOCK_SIZE;
            if let Some((_, dir)) = self.directory.read().probe(&doc_header.key, None) {
                if dir.offset == dir_offset_blocks && !dir.is_pinned(now) && self.needs_evacuation(&dir) {
                    self.queue_evacuation(doc_header.key, dir);
                }
            }

            scanned += round_to_cache_block(u64::from(doc_header.len)).max(CACHE_BLOCK_SIZE);
        }
        Ok(())
    }

    /// Reads a fragment's current on-disk bytes and re-stages them into the aggregation buffer so
    /// they survive past the write cursor, then records the relocation.
    async fn relocate_fragment(&self, file: &Arc<std::fs::File>, key: CacheKey, old_dir: Dir) -> Result<(), VolumeError> {
        let offset = self.data_base + old_dir.offset * CACHE_BLOCK_SIZE;
        let aio = self.aio().clone();
        let header_bytes = aio.read_at(file.clone(), offset, DOC_HEADER_LEN).await?;
        let doc_header = DocHeader::decode(header_bytes).ok_or(VolumeError::NoDoc)?;
        let body_len = doc_header.len as usize - DOC_HEADER_LEN;
        let body = aio.read_at(file.clone(), offset + DOC_HEADER_LEN as u64, body_len).await?;

        let mut encoded = BytesMut::with_capacity(doc_header.len as usize);
        doc_header.encode(&mut encoded);
        encoded.extend_from_slice(&body);

        let phase = self.phase();
        let staged = {
            let mut agg = self.agg.write();
            agg.stage(key, &encoded)?
        };
        let new_dir = Dir::new(
            (self.write_pos() + staged.buffer_offset) / CACHE_BLOCK_SIZE,
            round_to_cache_block(encoded.len() as u64) as u32,
            phase,
            true,
            doc_header.pinned,
        );
        self.record_relocation(key, new_dir);
        trace!(key = %key, old_offset = old_dir.offset, new_offset = new_dir.offset, "relocated fragment");
        Ok(())
    }

    /// Persists the current header to both its header and footer slots. Called on
    /// `config.dir_sync_interval` and once before a clean shutdown; a crash between the two writes
    /// below is exactly the divergence [`crate::recovery::select_trusted`] is built to resolve.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the underlying [`AioBridge`].
    #[instrument(skip(self, file), fields(volume = self.config.number))]
    pub async fn dir_sync(&self, file: Arc<std::fs::File>) -> Result<(), VolumeError> {
        let mut snapshot = self.header_snapshot();
        snapshot.sync_serial += 1;
        self.set_header(snapshot);

        let mut bytes = BytesMut::with_capacity(header::VOL_HEADER_LEN);
        snapshot.encode(&mut bytes);
        let bytes = bytes.freeze();

        let aio = self.aio().clone();
        aio.write_at(file.clone(), self.meta_base, bytes.clone()).await?;
        aio.write_at(file, self.meta_base + CACHE_BLOCK_SIZE, bytes).await?;
        debug!(volume = self.config.number, sync_serial = snapshot.sync_serial, "synced volume header/footer");
        Ok(())
    }

    /// Reads both persisted header/footer slots off disk, for startup recovery. A slot that
    /// doesn't decode to a valid record (e.g. a never-initialized volume) comes back with
    /// `magic == 0`, which [`crate::recovery::select_trusted`] treats as invalid.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the underlying [`AioBridge`].
    pub async fn read_header_footer(&self, file: Arc<std::fs::File>) -> Result<(VolHeaderFooter, VolHeaderFooter), RecoveryError> {
        let aio = self.aio().clone();
        let header_bytes = aio.read_at(file.clone(), self.meta_base, header::VOL_HEADER_LEN).await?;
        let footer_bytes = aio.read_at(file, self.meta_base + CACHE_BLOCK_SIZE, header::VOL_HEADER_LEN).await?;
        let blank = || {
            let mut h = VolHeaderFooter::new(self.config.number, 0);
            h.magic = 0;
            h
        };
        let header = VolHeaderFooter::decode(header_bytes).unwrap_or_else(blank);
        let footer = VolHeaderFooter::decode(footer_bytes).unwrap_or_else(blank);
        Ok((header, footer))
    }

    /// Wraps the write cursor back to the start of the data region once it has reached capacity,
    /// flipping `phase` so stale entries from the previous lap are distinguishable (spec.md §4.4).
    fn maybe_wrap(&self, header: &mut VolHeaderFooter) {
        if self.write_pos() >= self.capacity_bytes() {
            self.write_pos.store(CACHE_BLOCK_SIZE, Ordering::Release);
            header.write_pos = 1;
            header.phase = !header.phase;
            header.generation += 1;
        }
    }

    /// True once the write cursor has come within [`EVACUATION_SIZE`] of `dir`'s location, meaning
    /// the next aggregation flush could overwrite it before a reader finishes with it.
    #[must_use]
    pub fn needs_evacuation(&self, dir: &Dir) -> bool {
        let dir_offset_bytes = dir.offset * CACHE_BLOCK_SIZE;
        let cursor = self.write_pos();
        dir_offset_bytes >= cursor && dir_offset_bytes - cursor < EVACUATION_SIZE
    }

    pub fn queue_evacuation(&self, key: CacheKey, dir: Dir) {
        self.evacuator.write().queue(key, dir);
    }

    pub fn drain_pending_evacuations(&self) -> Vec<EvacuationCandidate> {
        self.evacuator.write().take_pending()
    }

    pub fn record_relocation(&self, key: CacheKey, new_dir: Dir) {
        self.evacuator.write().mark_relocated(key, new_dir);
        if let Ok(idx) = self.directory.write().insert(&key, new_dir) {
            let _ = idx;
            self.evacuator.write().clear_lookaside(&key);
        }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        if let Some((idx, _)) = self.directory.read().probe(key, None) {
            self.directory.write().delete_at(key, idx);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn directory(&self) -> &RwLock<Directory> {
        &self.directory
    }

    #[must_use]
    pub fn header_snapshot(&self) -> VolHeaderFooter {
        *self.header.read()
    }

    pub fn set_header(&self, header: VolHeaderFooter) {
        *self.header.write() = header;
        self.write_pos.store(header.write_pos * CACHE_BLOCK_SIZE, Ordering::Release);
    }

    #[must_use]
    pub fn open_objects(&self) -> &OpenObjectTable {
        &self.open_objects
    }

    #[must_use]
    pub fn aio(&self) -> &Arc<dyn AioBridge> {
        self.disk.aio()
    }

    #[must_use]
    pub fn data_base(&self) -> u64 {
        self.data_base
    }
}

#[must_use]
pub fn round_fragment_len(len: u32) -> u64 {
    round_to_cache_block(u64::from(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{io::ProductionAio, span::{DeviceId, Span}};
    use std::path::PathBuf;

    fn test_volume() -> Volume {
        let span = Span {
            blocks: 1024,
            offset: 0,
            sector_size: 512,
            alignment: 512,
            device: DeviceId { major: 8, minor: 1 },
            path: PathBuf::from("/tmp/volume-test"),
            volume_pin: None,
            hash_seed: "seed".into(),
            mmap_capable: true,
        };
        let disk = Arc::new(Disk::new(span, Arc::new(ProductionAio), 8));
        let config = VolumeConfigBuilder::new(1, 256).segments(2).buckets(8).build().unwrap();
        Volume::new(config, disk, 0, 0)
    }

    #[test]
    fn new_volume_starts_past_the_reserved_zero_offset() {
        let vol = test_volume();
        // Cache-block 0 is reserved: `Dir::is_empty` treats `offset == 0` as unoccupied, so the
        // first real write must land at block 1.
        assert_eq!(vol.write_pos(), CACHE_BLOCK_SIZE);
        assert!(!vol.phase());
    }

    #[test]
    fn lookup_misses_on_empty_directory() {
        let vol = test_volume();
        let key = CacheKey::from_words([1, 2, 3, 4]);
        assert!(vol.lookup(&key).is_none());
    }

    #[test]
    fn needs_evacuation_is_true_just_ahead_of_cursor() {
        let vol = test_volume();
        let dir = Dir { offset: 10, approx_size: 1, tag: 0, phase: false, head: true, pinned: 0, ..Default::default() };
        assert!(vol.needs_evacuation(&dir));
    }
}
