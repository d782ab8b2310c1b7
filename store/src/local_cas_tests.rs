// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::os::unix::fs::PermissionsExt;

use fs::tree_builder::{DirectoryTree, TreeEntry, TreeSink};
use fs::{ObjectInfo, ObjectType, RelativePath};
use hashing::{Digest, HashFunction};

use crate::{generation_dir_name, LocalCas, Storage};

fn new_cas(hash_function: HashFunction) -> (tempfile::TempDir, LocalCas) {
    let dir = tempfile::tempdir().unwrap();
    let cas = LocalCas::open(dir.path(), hash_function).unwrap();
    (dir, cas)
}

struct CasSink<'a>(&'a LocalCas);

impl TreeSink for CasSink<'_> {
    fn store_blob(&mut self, _digest: Digest, bytes: bytes::Bytes) -> Result<(), String> {
        self.0.store_bytes(&bytes, false).map(|_| ())
    }

    fn store_tree(&mut self, digest: Digest, bytes: bytes::Bytes) -> Result<(), String> {
        let stored = self.0.store_tree(&bytes)?;
        assert_eq!(stored, digest);
        Ok(())
    }
}

#[test]
fn store_and_resolve_blob() {
    for hash_function in [HashFunction::Native, HashFunction::Compatible] {
        let (_dir, cas) = new_cas(hash_function);
        let digest = cas.store_bytes(b"roland", false).unwrap();
        assert_eq!(digest, hash_function.hash_blob(b"roland"));

        let path = cas.blob_path(digest, false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"roland");
        // Committed objects are read-only.
        assert_eq!(
            std::fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o444
        );
    }
}

#[test]
fn store_is_idempotent() {
    let (_dir, cas) = new_cas(HashFunction::Native);
    let first = cas.store_bytes(b"content", false).unwrap();
    let second = cas.store_bytes(b"content", false).unwrap();
    assert_eq!(first, second);
}

#[test]
fn executables_get_their_own_shard() {
    let (dir, cas) = new_cas(HashFunction::Native);
    let digest = cas.store_bytes(b"#!/bin/sh\n", true).unwrap();
    let path = cas.blob_path(digest, true).unwrap();
    assert!(path.starts_with(dir.path().join("casx")));
    assert_eq!(
        std::fs::metadata(&path).unwrap().permissions().mode() & 0o777,
        0o555
    );
}

#[test]
fn blob_is_promoted_across_shards() {
    let (_dir, cas) = new_cas(HashFunction::Compatible);
    let digest = cas.store_bytes(b"tool", false).unwrap();

    // Requesting the executable flavor promotes the object with exec permissions.
    let exec_path = cas.blob_path(digest, true).unwrap();
    assert_eq!(std::fs::read(&exec_path).unwrap(), b"tool");
    assert_eq!(
        std::fs::metadata(&exec_path).unwrap().permissions().mode() & 0o777,
        0o555
    );
}

#[test]
fn store_file_streams_and_hashes() {
    let (_dir, cas) = new_cas(HashFunction::Native);
    let source = tempfile::NamedTempFile::new().unwrap();
    let content = vec![0x5a_u8; 4096 * 2 + 100];
    std::fs::write(source.path(), &content).unwrap();

    let digest = cas.store_file(source.path(), false).unwrap();
    assert_eq!(digest, HashFunction::Native.hash_blob(&content));
    assert!(cas.blob_path(digest, false).is_some());
}

#[test]
fn trees_are_validated_before_storing() {
    let (_dir, cas) = new_cas(HashFunction::Native);
    cas.store_tree(b"not a git tree").expect_err("garbage is not a canonical tree");

    // A real tree stores fine and resolves through the tree shard.
    let tree = DirectoryTree::from_entries(vec![(
        RelativePath::new("file").unwrap(),
        TreeEntry::Blob {
            digest: cas.store_bytes(b"content", false).unwrap(),
            executable: false,
        },
    )])
    .unwrap();
    let root = tree.write(HashFunction::Native, &mut CasSink(&cas)).unwrap();
    assert!(cas.tree_path(root).is_some());
}

#[test]
fn missing_reports_only_absent_objects() {
    let (_dir, cas) = new_cas(HashFunction::Compatible);
    let present = ObjectInfo::new(cas.store_bytes(b"present", false).unwrap(), ObjectType::File);
    let absent = ObjectInfo::new(
        HashFunction::Compatible.hash_blob(b"never stored"),
        ObjectType::File,
    );
    assert_eq!(cas.missing([&present, &absent]), vec![absent]);
}

#[test]
fn dump_to_stream_round_trips() {
    let (_dir, cas) = new_cas(HashFunction::Native);
    let digest = cas.store_bytes(b"streamed content", false).unwrap();
    let mut out = Vec::new();
    cas.dump_to_stream(&ObjectInfo::new(digest, ObjectType::File), &mut out)
        .unwrap();
    assert_eq!(out, b"streamed content");
}

#[test]
fn object_size_reconstructs_unknown_sizes() {
    let (_dir, cas) = new_cas(HashFunction::Native);
    let digest = cas.store_bytes(b"sized", false).unwrap();
    // A size-unknown handle to the same content, as parsed out of a git tree.
    let unknown = ObjectInfo::new(Digest::new(digest.hash, 0), ObjectType::File);
    assert_eq!(cas.object_size(&unknown), Some(5));
}

#[test]
fn storage_layout_separates_generations() {
    let root = tempfile::tempdir().unwrap();
    let native = Storage::open(root.path(), HashFunction::Native).unwrap();
    let compatible = Storage::open(root.path(), HashFunction::Compatible).unwrap();

    native.cas().store_bytes(b"object", false).unwrap();
    let digest = HashFunction::Compatible.hash_blob(b"object");
    assert!(compatible.cas().blob_path(digest, false).is_none());

    assert!(root
        .path()
        .join("protocol-dependent")
        .join(generation_dir_name(HashFunction::Native))
        .join("casf")
        .is_dir());
}
