//! Top-level cache engine handle (spec.md §6): the external surface an HTTP/QUIC proxy calls into.
//! Owns the volumes carved out of the configured [`Store`] and routes each key to its volume by a
//! stable hash, the way the original cache's global "volume assignment table" does.

use std::sync::Arc;

use bytes::Bytes;
use tracing::instrument;

use crate::{
    config::VolumeConfig,
    directory::Dir,
    disk::Disk,
    doc::{AlternateVec, DocHeader, DOC_HEADER_LEN},
    error::{CacheError, KeyedCacheError},
    key::{CacheFragType, CacheKey},
    ram_cache::RamCache,
    recovery::{self, RecoveryError, RecoveryReport},
    store::Store,
    vc::{CancelToken, ReadResult, ReadVC, WriteVC},
    volume::Volume,
};

/// One routable cache volume: the open file backing its [`Disk`]/[`Volume`] pair.
struct RoutedVolume {
    volume: Arc<Volume>,
    file: Arc<std::fs::File>,
}

/// The cache engine: a [`Store`]'s worth of volumes, an optional RAM front, and the routing table
/// mapping keys to volumes.
pub struct Engine {
    volumes: Vec<RoutedVolume>,
    ram: Option<RamCache>,
    store: Store,
}

impl Engine {
    #[must_use]
    pub fn new(store: Store, volumes: Vec<(Arc<Volume>, Arc<std::fs::File>)>, ram: Option<RamCache>) -> Self {
        Self {
            volumes: volumes.into_iter().map(|(volume, file)| RoutedVolume { volume, file }).collect(),
            ram,
            store,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    /// Routes `key` to a volume by its first word modulo the volume count, mirroring the span/
    /// volume hashing convention documented on [`CacheKey`].
    fn route(&self, key: &CacheKey) -> Option<&RoutedVolume> {
        if self.volumes.is_empty() {
            return None;
        }
        let idx = (key.slice32(0) as usize) % self.volumes.len();
        self.volumes.get(idx)
    }

    /// Fast existence check that does not fetch the payload; consults the RAM cache first.
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> bool {
        if self.ram.as_ref().is_some_and(|ram| ram.get(key).is_some()) {
            return true;
        }
        self.route(key).is_some_and(|routed| routed.volume.lookup(key).is_some())
    }

    /// Opens a non-negotiated read: any stored fragment for `key` is returned verbatim. Use
    /// [`Engine::open_read_http`] when HTTP alternate selection is required.
    ///
    /// # Errors
    ///
    /// See [`CacheError`]; most commonly [`CacheError::NoDoc`].
    pub async fn open_read(&self, key: CacheKey) -> Result<ReadResult, KeyedCacheError> {
        self.open_read_http(key, CacheFragType::Generic, "", "").await
    }

    /// Opens an HTTP-aware read, selecting among stored alternates by `accept_encoding` and
    /// `accept_language`.
    ///
    /// # Errors
    ///
    /// See [`CacheError`]; in particular [`CacheError::AltMiss`] when no alternate satisfies the
    /// request.
    #[instrument(skip(self, accept_encoding, accept_language), fields(key = %key))]
    pub async fn open_read_http(
        &self,
        key: CacheKey,
        frag_type: CacheFragType,
        accept_encoding: &str,
        accept_language: &str,
    ) -> Result<ReadResult, KeyedCacheError> {
        if let Some(ram) = &self.ram {
            if let Some(bytes) = ram.get(&key) {
                return Ok(ReadResult {
                    header: placeholder_header(key, bytes.len() as u32),
                    payload: Bytes::from(bytes),
                });
            }
        }

        let routed = self.route(&key).ok_or(CacheError::NoDoc).map_err(|e| KeyedCacheError::new(key, e))?;
        let mut vc = ReadVC::new(key, frag_type, routed.volume.clone(), routed.file.clone(), CancelToken::new());
        vc.accept_encoding = accept_encoding.to_string();
        vc.accept_language = accept_language.to_string();

        let result = vc.run().await.map_err(|e| KeyedCacheError::new(key, e))?;
        if let Some(ram) = &self.ram {
            ram.insert(key, &result.payload);
        }
        Ok(result)
    }

    /// Opens a write for `key`, staging the fragment into its volume's aggregation buffer.
    /// `max_writers` overrides the volume's `config.default_max_writers` for this call, or `None`
    /// to use the configured default (spec.md §4.3's `open_write(vc, allow_if_writers,
    /// max_writers)` contract).
    ///
    /// # Errors
    ///
    /// [`CacheError::DocBusy`] if the volume's writer admission policy or cap rejects the write;
    /// [`CacheError::NoSpace`] for any other staging failure; [`CacheError::Canceled`] if canceled
    /// before it lands.
    #[instrument(skip(self, alternates, payload), fields(key = %key))]
    pub async fn open_write(
        &self,
        key: CacheKey,
        frag_type: CacheFragType,
        alternates: &AlternateVec,
        payload: &[u8],
        pinned: u32,
        max_writers: Option<u32>,
    ) -> Result<Dir, KeyedCacheError> {
        let routed = self.route(&key).ok_or(CacheError::NoSpace).map_err(|e| KeyedCacheError::new(key, e))?;

        let mut alt_buf = bytes::BytesMut::new();
        alternates.encode(&mut alt_buf);

        let header = DocHeader {
            magic: crate::doc::DOC_MAGIC,
            len: 0,
            total_len: payload.len() as u64,
            first_key: key,
            key,
            hlen: alt_buf.len() as u32,
            doc_type: frag_type as u8,
            v_major: crate::doc::CURRENT_MAJOR_VERSION,
            v_minor: crate::doc::CURRENT_MINOR_VERSION,
            sync_serial: 0,
            write_serial: 0,
            pinned,
            checksum: 0,
        };

        let vc = WriteVC::new(key, routed.volume.clone(), routed.file.clone(), CancelToken::new())
            .with_max_writers(max_writers);
        let dir = vc
            .run(&header, &alt_buf, payload)
            .await
            .map_err(|e| KeyedCacheError::new(key, e))?;

        if let Some(ram) = &self.ram {
            ram.insert(key, payload);
        }
        Ok(dir)
    }

    /// Removes `key` from its volume's directory (and the RAM cache, if present). A miss is not an
    /// error: removal is idempotent.
    pub fn remove(&self, key: &CacheKey) {
        if let Some(ram) = &self.ram {
            ram.remove(key);
        }
        if let Some(routed) = self.route(key) {
            routed.volume.remove(key);
        }
    }

    /// Iterates every occupied directory entry across every volume, for admin/diagnostic scans
    /// (spec.md §6 `scan`). Does not include entries only visible via a volume's evacuation
    /// lookaside index, matching the original cache's scan semantics of walking the durable
    /// directory.
    pub fn scan(&self) -> impl Iterator<Item = Dir> + '_ {
        self.volumes.iter().flat_map(|routed| {
            let snapshot: Vec<Dir> = routed.volume.directory().read().iter_occupied().collect();
            snapshot.into_iter()
        })
    }
}

impl From<KeyedCacheError> for CacheError {
    fn from(err: KeyedCacheError) -> Self {
        err.error
    }
}

/// Synthesizes a header for a RAM-cache hit, since the RAM cache stores only the selected
/// alternate's decoded payload, not the on-disk framing.
fn placeholder_header(key: CacheKey, payload_len: u32) -> DocHeader {
    DocHeader {
        magic: crate::doc::DOC_MAGIC,
        len: DOC_HEADER_LEN as u32 + payload_len,
        total_len: u64::from(payload_len),
        first_key: key,
        key,
        hlen: 0,
        doc_type: 0,
        v_major: crate::doc::CURRENT_MAJOR_VERSION,
        v_minor: crate::doc::CURRENT_MINOR_VERSION,
        sync_serial: 0,
        write_serial: 0,
        pinned: 0,
        checksum: crate::doc::DOC_NO_CHECKSUM,
    }
}

/// Builds a [`Disk`]'s worth of [`Volume`]s from `configs`, carving extents out of `disk` in order.
///
/// # Errors
///
/// Propagates [`crate::disk::DiskError`] if a requested volume size does not fit in the disk's free
/// list.
pub fn carve_volumes(
    disk: &Arc<Disk>,
    configs: Vec<VolumeConfig>,
    create_time: u64,
) -> Result<Vec<Arc<Volume>>, crate::disk::DiskError> {
    let mut volumes = Vec::with_capacity(configs.len());
    for config in configs {
        let block = disk.create_volume(config.number, config.size_store_blocks)?;
        volumes.push(Arc::new(Volume::new(config, disk.clone(), block.offset, create_time)));
    }
    Ok(volumes)
}

/// Runs startup recovery (spec.md §4.8) for every volume in `volumes`: reads its persisted
/// header/footer slots and replays forward from the trusted record. Called once, before an
/// [`Engine`] is handed out to callers.
///
/// # Errors
///
/// Propagates [`RecoveryError`] from either the header/footer read or the replay itself for the
/// first volume that fails; callers that want best-effort recovery across volumes should call
/// [`recovery::recover_volume`] per-volume instead.
#[instrument(skip(volumes))]
pub async fn recover_volumes(
    volumes: &[(Arc<Volume>, Arc<std::fs::File>)],
) -> Result<Vec<RecoveryReport>, RecoveryError> {
    let mut reports = Vec::with_capacity(volumes.len());
    for (volume, file) in volumes {
        let (header, footer) = volume.read_header_footer(file.clone()).await?;
        let report = recovery::recover_volume(volume, file.clone(), header, footer).await?;
        info!(volume = volume.number(), ?report, "volume recovered");
        reports.push(report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::VolumeConfigBuilder, io::ProductionAio, span::{DeviceId, Span}};
    use std::path::PathBuf;

    fn test_engine() -> Engine {
        let span = Span {
            blocks: 2048,
            offset: 0,
            sector_size: 512,
            alignment: 512,
            device: DeviceId { major: 8, minor: 1 },
            path: PathBuf::from("/tmp/engine-test"),
            volume_pin: None,
            hash_seed: "seed".into(),
            mmap_capable: true,
        };
        let disk = Arc::new(Disk::new(span.clone(), Arc::new(ProductionAio), 8));
        let mut store = Store::new();
        store.add_span(span);

        let config = VolumeConfigBuilder::new(1, 512).segments(2).buckets(8).build().unwrap();
        let volumes = carve_volumes(&disk, vec![config], 0).unwrap();
        let file = Arc::new(std::fs::File::open("/dev/null").unwrap());
        Engine::new(store, vec![(volumes[0].clone(), file)], None)
    }

    #[test]
    fn lookup_misses_on_empty_engine() {
        let engine = test_engine();
        let key = CacheKey::from_words([1, 2, 3, 4]);
        assert!(!engine.lookup(&key));
    }

    #[test]
    fn routes_consistently_for_the_same_key() {
        let engine = test_engine();
        let key = CacheKey::from_words([7, 0, 0, 0]);
        let first = engine.route(&key).map(|r| r.volume.number());
        let second = engine.route(&key).map(|r| r.volume.number());
        assert_eq!(first, second);
    }
}
