// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Write;

use crate::{async_verified_copy, HashFunction, WriterHasher};

// `git hash-object` of the empty blob and of the empty tree.
const GIT_EMPTY_BLOB: &str = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";
const GIT_EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
// `echo 'test content' | git hash-object --stdin`
const GIT_TEST_CONTENT: &str = "d670460b4b4aece5915caf5c68d12f560a9fe3e4";
// FIPS 180-2 test vector.
const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
const SHA256_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[test]
fn native_empty_objects_match_git() {
    let digest = HashFunction::Native.empty_blob_digest();
    assert_eq!(digest.hash.to_hex(), GIT_EMPTY_BLOB);
    assert_eq!(digest.size_bytes, 0);

    let digest = HashFunction::Native.empty_tree_digest();
    assert_eq!(digest.hash.to_hex(), GIT_EMPTY_TREE);
    assert_eq!(digest.size_bytes, 0);
}

#[test]
fn native_blob_matches_git() {
    let digest = HashFunction::Native.hash_blob(b"test content\n");
    assert_eq!(digest.hash.to_hex(), GIT_TEST_CONTENT);
    assert_eq!(digest.size_bytes, 13);
}

#[test]
fn compatible_is_plain_sha256() {
    let digest = HashFunction::Compatible.hash_data(b"abc");
    assert_eq!(digest.hash.to_hex(), SHA256_ABC);

    // In compatible mode there is no framing: blob and plain data hashing agree.
    assert_eq!(HashFunction::Compatible.hash_blob(b"abc"), digest);
    assert_eq!(
        HashFunction::Compatible.empty_blob_digest().hash.to_hex(),
        SHA256_EMPTY
    );
    // ... and tree payloads are never re-prefixed.
    assert_eq!(HashFunction::Compatible.hash_tree(b"abc"), digest);
}

#[test]
fn native_framing_separates_blob_and_tree() {
    let blob = HashFunction::Native.hash_blob(b"payload");
    let tree = HashFunction::Native.hash_tree(b"payload");
    let plain = HashFunction::Native.hash_data(b"payload");
    assert_ne!(blob, tree);
    assert_ne!(blob, plain);
    assert_ne!(tree, plain);
}

#[tokio::test]
async fn hash_file_streams_to_same_digest() {
    let dir = tempfile::tempdir().unwrap();
    // More than one read chunk, to exercise the streaming path.
    let content = vec![0xa5_u8; 4096 * 3 + 17];
    let path = dir.path().join("blob");
    std::fs::write(&path, &content).unwrap();

    for mode in [HashFunction::Native, HashFunction::Compatible] {
        let streamed = mode.hash_file(&path, false).await.unwrap();
        assert_eq!(streamed, mode.hash_blob(&content));
    }
}

#[test]
fn writer_hasher_counts_and_hashes() {
    let mut out = Vec::new();
    let mut hasher = WriterHasher::new(HashFunction::Native.blob_hasher(13), &mut out);
    hasher.write_all(b"test content\n").unwrap();
    let (digest, _) = hasher.finish();
    assert_eq!(digest.hash.to_hex(), GIT_TEST_CONTENT);
    assert_eq!(digest.size_bytes, 13);
    assert_eq!(out, b"test content\n");
}

#[tokio::test]
async fn verified_copy_detects_mismatch() {
    let expected = HashFunction::Compatible.hash_blob(b"expected content");

    let mut out = Vec::new();
    let matches = async_verified_copy(
        HashFunction::Compatible,
        expected,
        false,
        &mut &b"expected content"[..],
        &mut out,
    )
    .await
    .unwrap();
    assert!(matches);
    assert_eq!(out, b"expected content");

    let mut out = Vec::new();
    let matches = async_verified_copy(
        HashFunction::Compatible,
        expected,
        false,
        &mut &b"corrupted contentX"[..],
        &mut out,
    )
    .await
    .unwrap();
    assert!(!matches);
}
