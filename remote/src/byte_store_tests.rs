// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;

use fs::{ObjectInfo, ObjectType};
use grpc_util::retry::RetryConfig;
use hashing::HashFunction;
use testutil::StubCas;

use crate::byte_store::ByteStore;
use crate::{RemoteOptions, GRPC_DEFAULT_MAX_RECV_MESSAGE_LENGTH};

const HASH_FUNCTION: HashFunction = HashFunction::Compatible;

fn options(cas: &StubCas) -> RemoteOptions {
    let mut options = RemoteOptions::new(&cas.address);
    options.retry = RetryConfig::new(Some(1), Some(1), Some(3)).unwrap();
    options
}

fn byte_store(cas: &StubCas) -> ByteStore {
    ByteStore::new(&options(cas), HASH_FUNCTION).unwrap()
}

fn file_info(content: &[u8]) -> ObjectInfo {
    ObjectInfo::new(HASH_FUNCTION.hash_blob(content), ObjectType::File)
}

#[tokio::test]
async fn small_blob_round_trips_via_batch_api() {
    let cas = StubCas::empty().await;
    let store = byte_store(&cas);

    let info = file_info(b"small content");
    store
        .store_blobs(vec![(info.digest, Bytes::from_static(b"small content"))], true)
        .await
        .unwrap();
    assert_eq!(cas.request_count("BatchUpdateBlobs"), 1);
    assert_eq!(cas.request_count("ByteStream.Write"), 0);

    let loaded = store.load_object(&info).await.unwrap().unwrap();
    assert_eq!(loaded, Bytes::from_static(b"small content"));
    assert_eq!(cas.request_count("BatchReadBlobs"), 1);
}

#[tokio::test]
async fn batch_and_stream_split_by_size() {
    // Two blobs: 3 bytes and one byte past the message cap. The small one must go through
    // BatchUpdateBlobs, the large one through ByteStream.Write, and both must round-trip.
    let cas = StubCas::empty().await;
    let store = byte_store(&cas);

    let small = Bytes::from_static(b"abc");
    let large = Bytes::from(vec![0x2a_u8; GRPC_DEFAULT_MAX_RECV_MESSAGE_LENGTH + 1]);
    let small_info = file_info(&small);
    let large_info = file_info(&large);

    store
        .store_blobs(
            vec![(small_info.digest, small.clone()), (large_info.digest, large.clone())],
            true,
        )
        .await
        .unwrap();

    assert_eq!(cas.request_count("BatchUpdateBlobs"), 1);
    assert_eq!(cas.request_count("ByteStream.Write"), 1);

    assert_eq!(store.load_object(&small_info).await.unwrap().unwrap(), small);
    assert_eq!(store.load_object(&large_info).await.unwrap().unwrap(), large);
    // The large read must have gone through the byte stream.
    assert_eq!(cas.request_count("ByteStream.Read"), 1);
}

#[tokio::test]
async fn find_missing_filters_uploads() {
    let cas = StubCas::empty().await;
    let store = byte_store(&cas);

    let present = file_info(b"already there");
    cas.insert_blob(&present.digest.hash.to_hex(), Bytes::from_static(b"already there"));
    let absent = file_info(b"not yet there");

    let missing = store
        .find_missing_digests(vec![present.digest, absent.digest])
        .await
        .unwrap();
    assert_eq!(missing.len(), 1);
    assert!(missing.contains(&absent.digest));

    // With find-missing enabled, the present blob is not re-uploaded.
    store
        .store_blobs(
            vec![
                (present.digest, Bytes::from_static(b"already there")),
                (absent.digest, Bytes::from_static(b"not yet there")),
            ],
            false,
        )
        .await
        .unwrap();
    assert_eq!(cas.request_count("FindMissingBlobs"), 2);
    assert!(cas.blob(&absent.digest.hash.to_hex()).is_some());
}

#[tokio::test]
async fn empty_find_missing_makes_no_request() {
    let cas = StubCas::empty().await;
    let store = byte_store(&cas);
    let missing = store.find_missing_digests(vec![]).await.unwrap();
    assert!(missing.is_empty());
    assert_eq!(cas.request_count("FindMissingBlobs"), 0);
}

#[tokio::test]
async fn interrupted_stream_write_resumes_from_committed_offset() {
    // The server drops the connection after ~1 MiB; the client must query the committed
    // offset and finish the upload, and the stored blob must match the original bit-for-bit.
    let cas = StubCas::builder().interrupt_writes(1, 1024 * 1024).build().await;
    let store = byte_store(&cas);

    let large = Bytes::from(
        (0..GRPC_DEFAULT_MAX_RECV_MESSAGE_LENGTH + 1)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<u8>>(),
    );
    let info = file_info(&large);

    store
        .store_blobs(vec![(info.digest, large.clone())], true)
        .await
        .unwrap();

    assert_eq!(cas.request_count("ByteStream.Write"), 2);
    assert_eq!(cas.request_count("QueryWriteStatus"), 1);
    assert_eq!(cas.blob(&info.digest.hash.to_hex()).unwrap(), large);

    // Loading it back verifies the digest of the reassembled content.
    assert_eq!(store.load_object(&info).await.unwrap().unwrap(), large);
}

#[tokio::test]
async fn load_of_missing_blob_is_none() {
    let cas = StubCas::empty().await;
    let store = byte_store(&cas);
    assert_eq!(store.load_object(&file_info(b"nowhere")).await.unwrap(), None);

    // Also through the streaming path.
    let large_info = ObjectInfo::new(
        HASH_FUNCTION.hash_blob(&vec![1_u8; GRPC_DEFAULT_MAX_RECV_MESSAGE_LENGTH + 1]),
        ObjectType::File,
    );
    assert_eq!(store.load_object(&large_info).await.unwrap(), None);
}

#[tokio::test]
async fn corrupt_content_is_rejected_on_load() {
    let cas = StubCas::empty().await;
    let store = byte_store(&cas);

    let info = file_info(b"expected content");
    cas.insert_blob(&info.digest.hash.to_hex(), Bytes::from_static(b"tampered"));
    store
        .load_object(&info)
        .await
        .expect_err("content not matching its digest must be rejected");
}

#[tokio::test]
async fn transient_errors_are_retried_to_exhaustion() {
    let cas = StubCas::builder().always_errors().build().await;
    let store = byte_store(&cas);
    store
        .find_missing_digests(vec![file_info(b"x").digest])
        .await
        .expect_err("the injected UNAVAILABLE must surface after retries");
    assert_eq!(cas.request_count("FindMissingBlobs"), 3);
}
