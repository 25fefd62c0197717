//! End-to-end tests driving the real async pipeline: `Engine`/`Volume`/`WriteVC`/`ReadVC` against a
//! temp-file-backed `ProductionAio`, rather than the unit tests each module runs against its own
//! in-memory pieces.

use std::sync::Arc;

use crate::{
    config::VolumeConfigBuilder,
    disk::Disk,
    doc::AlternateVec,
    engine::{carve_volumes, Engine},
    error::CacheError,
    io::{AioBridge, ProductionAio},
    key::{CacheFragType, CacheKey},
    recovery,
    span::{DeviceId, Span},
    store::Store,
};

async fn test_volume(
    blocks: u64,
    configure: impl FnOnce(VolumeConfigBuilder) -> VolumeConfigBuilder,
) -> (tempdir::TempDir, Engine, Arc<crate::volume::Volume>, Arc<std::fs::File>) {
    let dir = tempdir::TempDir::new("cache-engine-test").expect("tempdir");
    let path = dir.path().join("volume.dat");

    let span = Span {
        blocks,
        offset: 0,
        sector_size: 512,
        alignment: 512,
        device: DeviceId { major: 8, minor: 1 },
        path: path.clone(),
        volume_pin: None,
        hash_seed: "seed".into(),
        mmap_capable: true,
    };

    let aio: Arc<dyn AioBridge> = Arc::new(ProductionAio);
    let disk = Arc::new(Disk::new(span.clone(), aio.clone(), 8));
    let mut store = Store::new();
    store.add_span(span.clone());

    let config = configure(VolumeConfigBuilder::new(1, blocks)).build().unwrap();
    let volumes = carve_volumes(&disk, vec![config], 0).unwrap();

    let file = aio.open(&path).await.unwrap();
    aio.set_len(file.clone(), span.size_bytes()).await.unwrap();

    let engine = Engine::new(store, vec![(volumes[0].clone(), file.clone())], None);
    (dir, engine, volumes[0].clone(), file)
}

fn key(n: u32) -> CacheKey {
    CacheKey::from_words([n, n, n, n])
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let (_dir, engine, _volume, _file) = test_volume(128, |b| b).await;
    let k = key(1);
    let payload = b"hello from the cache".to_vec();

    engine
        .open_write(k, CacheFragType::Generic, &AlternateVec::default(), &payload, 0, None)
        .await
        .expect("write should succeed");

    let result = engine.open_read(k).await.expect("read should succeed");
    assert_eq!(result.payload.as_ref(), payload.as_slice());
}

#[tokio::test]
async fn multi_fragment_flush_uses_aligned_offsets() {
    let (_dir, _engine, volume, file) = test_volume(128, |b| b).await;
    let header = crate::doc::DocHeader {
        magic: crate::doc::DOC_MAGIC,
        len: 0,
        total_len: 0,
        first_key: key(0),
        key: key(0),
        hlen: 0,
        doc_type: 0,
        v_major: crate::doc::CURRENT_MAJOR_VERSION,
        v_minor: crate::doc::CURRENT_MINOR_VERSION,
        sync_serial: 0,
        write_serial: 0,
        pinned: 0,
        checksum: 0,
    };

    let mut dirs = Vec::new();
    for n in 1..=3u32 {
        let mut h = header;
        h.key = key(n);
        h.first_key = key(n);
        let dir = volume
            .write_fragment(key(n), &h, &[], &[n as u8; 7], file.clone(), None)
            .await
            .unwrap();
        dirs.push(dir);
    }
    volume.flush_aggregate(file.clone()).await.unwrap();

    // Every fragment after the first must land on its own cache-block boundary; a truncated offset
    // (the pre-fix bug) would put the 2nd and 3rd fragment inside the first one's bytes.
    assert_eq!(dirs[1].offset, dirs[0].offset + 1);
    assert_eq!(dirs[2].offset, dirs[1].offset + 1);

    for n in 1..=3u32 {
        let looked_up = volume.lookup(&key(n)).unwrap();
        assert_eq!(looked_up.offset, dirs[(n - 1) as usize].offset);
    }
}

#[tokio::test]
async fn wrap_and_evacuate_preserves_live_fragment() {
    let (_dir, _engine, volume, file) = test_volume(128, |b| b).await;

    let a = key(1);
    let payload_a = b"first lap".to_vec();
    let header_a = crate::doc::DocHeader {
        magic: crate::doc::DOC_MAGIC,
        len: 0,
        total_len: payload_a.len() as u64,
        first_key: a,
        key: a,
        hlen: 0,
        doc_type: 0,
        v_major: crate::doc::CURRENT_MAJOR_VERSION,
        v_minor: crate::doc::CURRENT_MINOR_VERSION,
        sync_serial: 0,
        write_serial: 0,
        pinned: 0,
        checksum: 0,
    };
    let old_dir = volume.write_fragment(a, &header_a, &[], &payload_a, file.clone(), None).await.unwrap();
    volume.flush_aggregate(file.clone()).await.unwrap();

    // Simulate the write cursor having wrapped back around to the start of the volume's data
    // region, the way `maybe_wrap` would after a full lap: `a`'s fragment is still physically
    // sitting at `old_dir.offset`, now ahead of the (reset) cursor.
    let mut wrapped = volume.header_snapshot();
    wrapped.write_pos = 1; // cache-block 0 is reserved; a fresh lap starts at block 1
    wrapped.phase = !wrapped.phase;
    volume.set_header(wrapped);

    let b = key(2);
    let payload_b = b"second lap".to_vec();
    let header_b = crate::doc::DocHeader { key: b, first_key: b, total_len: payload_b.len() as u64, ..header_a };
    volume.write_fragment(b, &header_b, &[], &payload_b, file.clone(), None).await.unwrap();
    volume.flush_aggregate(file.clone()).await.unwrap();

    let relocated = volume.lookup(&a).expect("a must still be reachable after evacuation");
    assert_ne!(relocated.offset, old_dir.offset, "a should have been relocated off its old offset");

    let read = crate::vc::ReadVC::new(a, CacheFragType::Generic, volume.clone(), file.clone(), crate::vc::CancelToken::new());
    let result = read.run().await.expect("relocated fragment should still read back cleanly");
    assert_eq!(result.payload.as_ref(), payload_a.as_slice());
}

#[tokio::test]
async fn crash_recovery_replays_missing_directory_entry() {
    let (_dir, _engine, volume, file) = test_volume(128, |b| b).await;

    let a = key(1);
    let header = crate::doc::DocHeader {
        magic: crate::doc::DOC_MAGIC,
        len: 0,
        total_len: 0,
        first_key: a,
        key: a,
        hlen: 0,
        doc_type: 0,
        v_major: crate::doc::CURRENT_MAJOR_VERSION,
        v_minor: crate::doc::CURRENT_MINOR_VERSION,
        sync_serial: 0,
        write_serial: 0,
        pinned: 0,
        checksum: 0,
    };
    volume.write_fragment(a, &header, &[], b"durable before sync", file.clone(), None).await.unwrap();
    volume.flush_aggregate(file.clone()).await.unwrap();
    volume.dir_sync(file.clone()).await.unwrap();

    let b = key(2);
    let payload_b = b"written after the last sync, crash before the next one".to_vec();
    let header_b = crate::doc::DocHeader { key: b, first_key: b, total_len: payload_b.len() as u64, ..header };
    volume.write_fragment(b, &header_b, &[], &payload_b, file.clone(), None).await.unwrap();
    volume.flush_aggregate(file.clone()).await.unwrap();

    // The crash happens before `b`'s entry is folded into whatever durable directory snapshot the
    // engine keeps; simulate that gap directly.
    assert!(volume.remove(&b));
    assert!(volume.lookup(&b).is_none());

    let (header, footer) = volume.read_header_footer(file.clone()).await.unwrap();
    let report = recovery::recover_volume(&volume, file.clone(), header, footer).await.unwrap();

    assert_eq!(report.fragments_replayed, 1);
    let recovered = volume.lookup(&b).expect("b should be replayed forward from the trusted write_pos");

    let read = crate::vc::ReadVC::new(b, CacheFragType::Generic, volume.clone(), file.clone(), crate::vc::CancelToken::new());
    let result = read.run().await.expect("recovered fragment should read back cleanly");
    assert_eq!(result.payload.as_ref(), payload_b.as_slice());
    assert_eq!(recovered.offset, recovered.offset);
}

#[tokio::test]
async fn writer_cap_rejects_second_concurrent_write() {
    let (_dir, engine, volume, _file) = test_volume(128, |b| b.default_max_writers(1).allow_if_writers(true)).await;
    let k = key(1);

    volume.open_objects().admit_writer(k, volume.config(), None).unwrap();

    let err = engine
        .open_write(k, CacheFragType::Generic, &AlternateVec::default(), b"rejected", 0, None)
        .await
        .unwrap_err();
    assert_eq!(CacheError::from(err), CacheError::DocBusy);

    volume.open_objects().release_writer(&k);
    engine
        .open_write(k, CacheFragType::Generic, &AlternateVec::default(), b"accepted", 0, None)
        .await
        .expect("write should succeed once the writer slot is free");
}
