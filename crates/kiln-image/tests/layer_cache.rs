//! Layer cache behavior under repeated and concurrent writes.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use flate2::Compression;
use flate2::write::GzEncoder;
use kiln_common::{Digest, KilnError};
use kiln_image::LayerCache;
use kiln_image::blob::ChannelReader;

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn entry_count(cache: &LayerCache) -> usize {
    std::fs::read_dir(cache.root().join("layers")).unwrap().count()
}

#[test]
fn repeated_writes_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LayerCache::open(dir.path()).unwrap();
    let blob = gzip(b"same content");

    let first = cache.write_compressed(blob.as_slice()).unwrap();
    let second = cache.write_compressed(blob.as_slice()).unwrap();

    assert_eq!(first, second);
    assert_eq!(entry_count(&cache), 1);
    assert_eq!(std::fs::read(&second.blob_path).unwrap(), blob);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_digest_writes_leave_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LayerCache::open(dir.path()).unwrap();
    let blob = Arc::new(gzip(&vec![7u8; 256 * 1024]));
    let expected = Digest::of(&blob);

    let writers: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let blob = Arc::clone(&blob);
            let expected = expected.clone();
            tokio::task::spawn_blocking(move || {
                cache.write_compressed_verified(&expected, blob.as_slice())
            })
        })
        .collect();

    let mut layers = Vec::new();
    for writer in writers {
        layers.push(writer.await.unwrap().unwrap());
    }

    assert!(layers.iter().all(|layer| layer == &layers[0]));
    assert_eq!(layers[0].digest, expected);
    assert_eq!(entry_count(&cache), 1);
    assert_eq!(std::fs::read(&layers[0].blob_path).unwrap(), *blob);
    // No staging directories survive.
    assert_eq!(
        std::fs::read_dir(dir.path().join("tmp")).unwrap().count(),
        0
    );
}

fn staging_dirs(cache: &LayerCache) -> usize {
    std::fs::read_dir(cache.root().join("tmp"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("write-"))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn opening_another_handle_mid_write_keeps_the_write() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LayerCache::open(dir.path()).unwrap();
    let blob = gzip(&vec![3u8; 64 * 1024]);
    let expected = Digest::of(&blob);

    let (tx, reader) = ChannelReader::channel();
    let writer = {
        let cache = cache.clone();
        let expected = expected.clone();
        tokio::task::spawn_blocking(move || cache.write_compressed_verified(&expected, reader))
    };

    let (head, tail) = blob.split_at(10);
    tx.send(Ok(Bytes::copy_from_slice(head))).await.unwrap();
    while staging_dirs(&cache) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // A second build or `kiln cache stats` opening the same directory.
    let other = LayerCache::open(dir.path()).unwrap();
    assert_eq!(staging_dirs(&other), 1);

    tx.send(Ok(Bytes::copy_from_slice(tail))).await.unwrap();
    drop(tx);

    let layer = writer.await.unwrap().unwrap();
    assert_eq!(layer.digest, expected);
    assert!(other.has(&expected));
    assert_eq!(staging_dirs(&cache), 0);
}

#[test]
fn integrity_failure_stores_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LayerCache::open(dir.path()).unwrap();
    let declared = Digest::of(b"what the manifest promised");
    let served = gzip(b"what the registry sent");

    let err = cache
        .write_compressed_verified(&declared, served.as_slice())
        .unwrap_err();

    assert!(matches!(
        &err,
        KilnError::Integrity { expected, actual }
            if expected == declared.as_str() && actual == Digest::of(&served).as_str()
    ));
    assert!(!cache.has(&declared));
    assert!(!cache.has(&Digest::of(&served)));
    assert_eq!(entry_count(&cache), 0);
}

#[test]
fn entries_survive_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let layer = {
        let cache = LayerCache::open(dir.path()).unwrap();
        cache.write_compressed(gzip(b"persisted").as_slice()).unwrap()
    };

    let reopened = LayerCache::open(dir.path()).unwrap();
    assert!(reopened.has(&layer.digest));
    assert_eq!(reopened.retrieve(&layer.digest).unwrap(), Some(layer));
}

#[test]
fn distinct_digests_coexist() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LayerCache::open(dir.path()).unwrap();

    let digests: Vec<_> = (0..3u8)
        .map(|i| cache.write_compressed(gzip(&[i; 10]).as_slice()).unwrap().digest)
        .collect();

    let listed: Vec<_> = cache
        .list_entries()
        .unwrap()
        .into_iter()
        .map(|layer| layer.digest)
        .collect();
    let mut sorted = digests;
    sorted.sort();
    assert_eq!(listed, sorted);
}
