//! This contains test scenarios that a given [RecordBackend] needs to pass,
//! directly and through a [CacheStore].
//! We use [rstest] and [rstest_reuse] to provide all backends we want to test
//! against, and then apply this template to all test functions.

use std::sync::Arc;

use bytes::Bytes;
use rstest::*;
use rstest_reuse::{self, *};

use super::{decode_header, CacheStore, MemoryRecordBackend, RecordBackend, RecordHeader};
use crate::cache;
use crate::fixtures;

/// Rewrites the header of an encoded record to claim another format version.
pub fn with_format_version(data: &[u8], format_version: u32) -> Bytes {
    let (header, payload) = decode_header(data).unwrap();
    let header = serde_json::to_vec(&RecordHeader {
        format_version,
        ..header
    })
    .unwrap();

    let mut buf = Vec::with_capacity(4 + header.len() + payload.len());
    buf.extend_from_slice(&(header.len() as u32).to_be_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::memory(cache::from_addr("memory://").await.unwrap())]
#[case::redb(cache::from_addr("redb://").await.unwrap())]
#[case::objectstore(cache::from_addr("objectstore+memory:///").await.unwrap())]
pub fn record_backends(#[case] backend: Arc<dyn RecordBackend>) {}

#[apply(record_backends)]
#[tokio::test]
async fn empty(backend: Arc<dyn RecordBackend>) {
    assert!(backend.complete_sequences().await.unwrap().is_empty());
    assert_eq!(None, backend.get(1).await.unwrap());
    // deleting something missing is fine.
    backend.delete(1).await.unwrap();
}

#[apply(record_backends)]
#[tokio::test]
async fn put_get_delete(backend: Arc<dyn RecordBackend>) {
    backend.put(1, Bytes::from_static(b"one")).await.unwrap();
    backend.put(2, Bytes::from_static(b"two")).await.unwrap();

    let mut sequences = backend.complete_sequences().await.unwrap();
    sequences.sort();
    assert_eq!(vec![1, 2], sequences);
    assert_eq!(
        Some(Bytes::from_static(b"two")),
        backend.get(2).await.unwrap()
    );

    backend.delete(2).await.unwrap();
    assert_eq!(vec![1], backend.complete_sequences().await.unwrap());
    assert_eq!(None, backend.get(2).await.unwrap());
}

/// Persist, then load back without anything else involved.
#[apply(record_backends)]
#[tokio::test]
async fn persist_load(backend: Arc<dyn RecordBackend>) {
    let store = CacheStore::new(backend, 3);
    assert_eq!(None, store.load_latest().await.unwrap());

    let generation = fixtures::sample_generation(1);
    assert_eq!(1, store.persist(&generation).await.unwrap());

    let loaded = store.load_latest().await.unwrap().expect("must load");
    assert_eq!(generation, loaded);
    assert_eq!(
        generation.resolve("/Movies/Alien (1979).mkv"),
        loaded.resolve("/Movies/Alien (1979).mkv")
    );
}

/// Sequences handed out by the store strictly increase, even if the
/// generation offered carries a lower one.
#[apply(record_backends)]
#[tokio::test]
async fn sequences_increase(backend: Arc<dyn RecordBackend>) {
    let store = CacheStore::new(backend, 10);

    assert_eq!(5, store.persist(&fixtures::sample_generation(5)).await.unwrap());
    assert_eq!(6, store.persist(&fixtures::sample_generation(2)).await.unwrap());
    assert_eq!(9, store.persist(&fixtures::sample_generation(9)).await.unwrap());

    let loaded = store.load_latest().await.unwrap().unwrap();
    assert_eq!(9, loaded.sequence());
}

#[apply(record_backends)]
#[tokio::test]
async fn prunes_old_records(backend: Arc<dyn RecordBackend>) {
    let store = CacheStore::new(backend.clone(), 2);
    for _ in 0..4 {
        store.persist(&fixtures::sample_generation(1)).await.unwrap();
    }

    let mut sequences = backend.complete_sequences().await.unwrap();
    sequences.sort();
    assert_eq!(vec![3, 4], sequences);
}

/// A corrupt newest record is discarded, and the next older one is used.
#[apply(record_backends)]
#[tokio::test]
async fn corrupt_latest_falls_back(backend: Arc<dyn RecordBackend>) {
    let store = CacheStore::new(backend.clone(), 3);
    let generation = fixtures::sample_generation(1);
    assert_eq!(1, store.persist(&generation).await.unwrap());

    backend
        .put(2, Bytes::from_static(b"\x00\x00\x00\x02{}garbage"))
        .await
        .unwrap();

    let loaded = store.load_latest().await.unwrap().expect("must fall back");
    assert_eq!(generation, loaded);
    assert_eq!(vec![1], backend.complete_sequences().await.unwrap());
}

/// Records of another format version are skipped, but left in place for
/// the binary that wrote them.
#[apply(record_backends)]
#[tokio::test]
async fn other_format_version_is_kept(backend: Arc<dyn RecordBackend>) {
    let store = CacheStore::new(backend.clone(), 3);
    let generation = fixtures::sample_generation(1);
    assert_eq!(1, store.persist(&generation).await.unwrap());

    let newer = super::record::encode(&fixtures::sample_generation(2)).unwrap();
    backend
        .put(2, with_format_version(&newer, super::FORMAT_VERSION + 1))
        .await
        .unwrap();

    assert_eq!(Some(generation), store.load_latest().await.unwrap());
    let mut sequences = backend.complete_sequences().await.unwrap();
    sequences.sort();
    assert_eq!(vec![1, 2], sequences);
}

/// Records without completion marker don't exist, as far as loading is
/// concerned.
#[tokio::test]
async fn incomplete_record_ignored() {
    let backend = MemoryRecordBackend::default();
    let store = CacheStore::new(Arc::new(backend.clone()), 3);
    let generation = fixtures::sample_generation(1);
    store.persist(&generation).await.unwrap();

    let newer = fixtures::sample_generation(2);
    backend.insert_incomplete(2, super::record::encode(&newer).unwrap());

    assert_eq!(Some(generation), store.load_latest().await.unwrap());
    // the next persist doesn't collide with the incomplete record's data.
    assert_eq!(2, store.persist(&newer).await.unwrap());
    assert_eq!(
        2,
        store.load_latest().await.unwrap().unwrap().sequence()
    );
}

#[tokio::test]
async fn all_corrupt_is_empty() {
    let backend = MemoryRecordBackend::default();
    backend.put(1, Bytes::from_static(b"nope")).await.unwrap();
    let store = CacheStore::new(Arc::new(backend), 3);

    assert_eq!(None, store.load_latest().await.unwrap());
}
