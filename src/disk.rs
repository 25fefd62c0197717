//! Disk (spec.md §4.2): owns one device's header, free list, and error threshold.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use fslock::LockFile;
use snafu::Snafu;

use crate::{
    config::STORE_BLOCK_SIZE,
    io::AioBridge,
    span::Span,
};

pub const DISK_HEADER_MAGIC: u32 = 0xABCD_1237;

#[derive(Debug, Snafu)]
pub enum DiskError {
    #[snafu(display("not enough free extent space to create volume {number} ({size} store blocks)"))]
    InsufficientSpace { number: i32, size: u64 },

    #[snafu(display("volume {number} does not exist on this disk"))]
    NoSuchVolume { number: i32 },

    #[snafu(display("disk is marked bad after exceeding its error threshold"))]
    Bad,

    #[snafu(display("disk I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("failed to acquire exclusive lock on device: {source}"))]
    Lock { source: std::io::Error },

    #[snafu(display("device is already opened by another engine process"))]
    AlreadyOpen,
}

impl From<std::io::Error> for DiskError {
    fn from(source: std::io::Error) -> Self {
        DiskError::Io { source }
    }
}

/// A variable-size extent of the underlying device, identified by byte offset and length in store
/// blocks. `number` is `-1` (via [`DiskVolBlock::FREE`]) while sitting in the free list; otherwise
/// it names the volume that owns it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskVolBlock {
    pub offset: u64,
    pub len_store_blocks: u64,
    pub number: i32,
    pub free: bool,
}

impl DiskVolBlock {
    pub const FREE_NUMBER: i32 = -1;

    #[must_use]
    pub fn free(offset: u64, len_store_blocks: u64) -> Self {
        Self {
            offset,
            len_store_blocks,
            number: Self::FREE_NUMBER,
            free: true,
        }
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.len_store_blocks * STORE_BLOCK_SIZE
    }
}

/// A single disk's header: extent free list plus summary counts, laid out per spec.md §6.
#[derive(Debug)]
struct DiskHeader {
    blocks: Vec<DiskVolBlock>,
    num_blocks: u64,
}

impl DiskHeader {
    fn new(total_blocks: u64) -> Self {
        Self {
            blocks: vec![DiskVolBlock::free(0, total_blocks)],
            num_blocks: total_blocks,
        }
    }

    fn num_free(&self) -> usize {
        self.blocks.iter().filter(|b| b.free).count()
    }

    fn num_used(&self) -> usize {
        self.blocks.iter().filter(|b| !b.free).count()
    }

    fn create_volume(&mut self, number: i32, size_store_blocks: u64) -> Result<DiskVolBlock, DiskError> {
        let idx = self
            .blocks
            .iter()
            .position(|b| b.free && b.len_store_blocks >= size_store_blocks)
            .ok_or(DiskError::InsufficientSpace {
                number,
                size: size_store_blocks,
            })?;

        let free_block = self.blocks[idx];
        let allocated = DiskVolBlock {
            offset: free_block.offset,
            len_store_blocks: size_store_blocks,
            number,
            free: false,
        };

        if free_block.len_store_blocks == size_store_blocks {
            self.blocks[idx] = allocated;
        } else {
            self.blocks[idx] = DiskVolBlock::free(
                free_block.offset + allocated.size_bytes(),
                free_block.len_store_blocks - size_store_blocks,
            );
            self.blocks.insert(idx, allocated);
        }

        Ok(allocated)
    }

    fn delete_volume(&mut self, number: i32) -> Result<(), DiskError> {
        let mut found = false;
        for block in &mut self.blocks {
            if !block.free && block.number == number {
                block.free = true;
                block.number = DiskVolBlock::FREE_NUMBER;
                found = true;
            }
        }
        if !found {
            return Err(DiskError::NoSuchVolume { number });
        }
        self.coalesce();
        Ok(())
    }

    /// Merges adjacent free extents so future `create_volume` calls see the largest possible
    /// contiguous region.
    fn coalesce(&mut self) {
        self.blocks.sort_by_key(|b| b.offset);
        let mut merged: Vec<DiskVolBlock> = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.free
                    && block.free
                    && last.offset + last.size_bytes() == block.offset
                {
                    last.len_store_blocks += block.len_store_blocks;
                    continue;
                }
            }
            merged.push(block);
        }
        self.blocks = merged;
    }
}

/// Wraps one physical device: its header/free list, an error counter, and the bridge used to
/// perform I/O against it. Shared (via `Arc`) between every [`crate::volume::Volume`] carved from
/// it, since they all observe the same bad-disk state.
pub struct Disk {
    header: parking_lot::Mutex<DiskHeader>,
    error_count: AtomicU32,
    error_threshold: u32,
    bad: std::sync::atomic::AtomicBool,
    bytes_skip: AtomicU64,
    aio: Arc<dyn AioBridge>,
    span: Span,
    /// Advisory exclusive lock preventing a second engine process from opening the same device,
    /// held for the lifetime of the `Disk`. Absent when constructed via [`Disk::new`] (tests, or
    /// callers that manage locking themselves).
    _lock: Option<parking_lot::Mutex<LockFile>>,
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("span", &self.span)
            .field("error_count", &self.error_count.load(Ordering::Relaxed))
            .field("error_threshold", &self.error_threshold)
            .field("bad", &self.is_bad())
            .field("locked", &self._lock.is_some())
            .finish_non_exhaustive()
    }
}

impl Disk {
    #[must_use]
    pub fn new(span: Span, aio: Arc<dyn AioBridge>, error_threshold: u32) -> Self {
        let total_blocks = span.blocks;
        Self {
            header: parking_lot::Mutex::new(DiskHeader::new(total_blocks)),
            error_count: AtomicU32::new(0),
            error_threshold,
            bad: std::sync::atomic::AtomicBool::new(false),
            bytes_skip: AtomicU64::new(span.offset),
            aio,
            span,
            _lock: None,
        }
    }

    /// Opens the disk exclusively, acquiring an advisory lock alongside `span.path` so a second
    /// engine process cannot concurrently operate on the same device (spec.md §4.2 "a disk is
    /// owned by exactly one running engine instance").
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::AlreadyOpen`] if another process already holds the lock, or
    /// [`DiskError::Lock`] if the lock file itself cannot be created.
    pub fn open(span: Span, aio: Arc<dyn AioBridge>, error_threshold: u32) -> Result<Self, DiskError> {
        let lock_path = span.path.with_extension("lock");
        let mut lock = LockFile::open(&lock_path).map_err(|source| DiskError::Lock { source })?;
        if !lock.try_lock().map_err(|source| DiskError::Lock { source })? {
            return Err(DiskError::AlreadyOpen);
        }

        let mut disk = Self::new(span, aio, error_threshold);
        disk._lock = Some(parking_lot::Mutex::new(lock));
        Ok(disk)
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    #[must_use]
    pub fn aio(&self) -> &Arc<dyn AioBridge> {
        &self.aio
    }

    #[must_use]
    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    /// Records an I/O error against this disk. Once `error_threshold` is crossed the disk (and
    /// transitively every volume backed by it) is marked bad, per spec.md §7: "if the AIO layer
    /// indicates a device error, the disk's error counter is incremented."
    pub fn record_io_error(&self) {
        let previous = self.error_count.fetch_add(1, Ordering::AcqRel);
        if previous + 1 >= self.error_threshold {
            self.bad.store(true, Ordering::Release);
            error!(threshold = self.error_threshold, "disk marked bad after exceeding error threshold");
            metrics::counter!("cache_disk_marked_bad_total", 1);
        }
    }

    #[must_use]
    pub fn num_errors(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    /// Carves `size_store_blocks` store blocks for volume `number`.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::Bad`] if the disk has exceeded its error threshold, or
    /// [`DiskError::InsufficientSpace`] if the free list cannot satisfy the request.
    pub fn create_volume(&self, number: i32, size_store_blocks: u64) -> Result<DiskVolBlock, DiskError> {
        if self.is_bad() {
            return Err(DiskError::Bad);
        }
        self.header.lock().create_volume(number, size_store_blocks)
    }

    /// Returns all extents belonging to volume `number` to the free list.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::NoSuchVolume`] if no extent is currently assigned to `number`.
    pub fn delete_volume(&self, number: i32) -> Result<(), DiskError> {
        self.header.lock().delete_volume(number)
    }

    #[must_use]
    pub fn free_extent_count(&self) -> usize {
        self.header.lock().num_free()
    }

    #[must_use]
    pub fn used_extent_count(&self) -> usize {
        self.header.lock().num_used()
    }

    /// Writes the disk header (magic, extent counts, free list) at the device's front, offset
    /// `skip`.
    ///
    /// # Errors
    ///
    /// Propagates any I/O error from the underlying [`AioBridge`].
    pub async fn sync(&self) -> Result<(), DiskError> {
        let file = self.aio.open(&self.span.path).await?;
        let bytes = self.serialize_header();
        let offset = self.bytes_skip.load(Ordering::Acquire);
        self.aio.write_at(file.clone(), offset, bytes).await?;
        self.aio.sync(file).await?;
        Ok(())
    }

    fn serialize_header(&self) -> bytes::Bytes {
        let header = self.header.lock();
        let mut buf = bytes::BytesMut::new();
        buf.extend_from_slice(&DISK_HEADER_MAGIC.to_le_bytes());
        buf.extend_from_slice(&(header.blocks.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(header.num_free() as u32).to_le_bytes());
        buf.extend_from_slice(&(header.num_used() as u32).to_le_bytes());
        buf.extend_from_slice(&header.num_blocks.to_le_bytes());
        for block in &header.blocks {
            buf.extend_from_slice(&block.offset.to_le_bytes());
            buf.extend_from_slice(&block.len_store_blocks.to_le_bytes());
            buf.extend_from_slice(&block.number.to_le_bytes());
            let flags: u32 = u32::from(block.free) << 3;
            buf.extend_from_slice(&flags.to_le_bytes());
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{io::ProductionAio, span::DeviceId};

    fn test_disk(blocks: u64, threshold: u32) -> Disk {
        let span = Span {
            blocks,
            offset: 0,
            sector_size: 512,
            alignment: 512,
            device: DeviceId { major: 8, minor: 1 },
            path: PathBuf::from("/tmp/disk-test"),
            volume_pin: None,
            hash_seed: "seed".into(),
            mmap_capable: true,
        };
        Disk::new(span, Arc::new(ProductionAio), threshold)
    }

    #[test]
    fn create_volume_shrinks_free_list() {
        let disk = test_disk(1000, 10);
        let block = disk.create_volume(1, 100).unwrap();
        assert_eq!(block.len_store_blocks, 100);
        assert_eq!(disk.used_extent_count(), 1);
    }

    #[test]
    fn create_volume_fails_when_out_of_space() {
        let disk = test_disk(50, 10);
        let err = disk.create_volume(1, 100).unwrap_err();
        assert!(matches!(err, DiskError::InsufficientSpace { .. }));
    }

    #[test]
    fn delete_volume_frees_and_coalesces() {
        let disk = test_disk(1000, 10);
        disk.create_volume(1, 100).unwrap();
        disk.create_volume(2, 200).unwrap();
        disk.delete_volume(1).unwrap();
        disk.delete_volume(2).unwrap();
        // Both deletions should merge back with surrounding free space.
        assert_eq!(disk.free_extent_count(), 1);
    }

    #[test]
    fn error_threshold_marks_disk_bad() {
        let disk = test_disk(1000, 3);
        assert!(!disk.is_bad());
        disk.record_io_error();
        disk.record_io_error();
        assert!(!disk.is_bad());
        disk.record_io_error();
        assert!(disk.is_bad());
        assert!(matches!(disk.create_volume(9, 1), Err(DiskError::Bad)));
    }
}
