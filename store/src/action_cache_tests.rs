// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use protos::gen::build::bazel::remote::execution::v2 as remexec;

use hashing::HashFunction;

use crate::LocalActionCache;

fn new_ac() -> (tempfile::TempDir, LocalActionCache) {
    let dir = tempfile::tempdir().unwrap();
    let ac = LocalActionCache::open(dir.path()).unwrap();
    (dir, ac)
}

fn sample_result(exit_code: i32) -> remexec::ActionResult {
    remexec::ActionResult {
        exit_code,
        stdout_digest: Some(HashFunction::Compatible.hash_blob(b"out").into()),
        stderr_digest: Some(HashFunction::Compatible.hash_blob(b"").into()),
        ..remexec::ActionResult::default()
    }
}

#[test]
fn read_of_absent_entry_is_a_miss() {
    let (_dir, ac) = new_ac();
    let digest = HashFunction::Compatible.hash_data(b"some action");
    assert_eq!(ac.read(digest).unwrap(), None);
    assert!(!ac.has(digest));
}

#[test]
fn write_then_read_round_trips() {
    let (_dir, ac) = new_ac();
    let digest = HashFunction::Compatible.hash_data(b"some action");
    let result = sample_result(0);
    ac.write(digest, &result).unwrap();
    assert_eq!(ac.read(digest).unwrap(), Some(result));
    assert!(ac.has(digest));
}

#[test]
fn writes_replace_existing_entries() {
    let (_dir, ac) = new_ac();
    let digest = HashFunction::Compatible.hash_data(b"some action");
    ac.write(digest, &sample_result(1)).unwrap();
    ac.write(digest, &sample_result(0)).unwrap();
    assert_eq!(ac.read(digest).unwrap().unwrap().exit_code, 0);
}

#[test]
fn corrupt_entries_count_as_misses() {
    let (dir, ac) = new_ac();
    let digest = HashFunction::Compatible.hash_data(b"some action");
    ac.write(digest, &sample_result(0)).unwrap();

    let hex = digest.hash.to_hex();
    let entry_path = dir.path().join("ac").join(&hex[..2]).join(&hex[2..]);
    // ActionResult with field 4 (exit_code) as a length-delimited value: undecodable.
    std::fs::write(&entry_path, [0x22, 0xff]).unwrap();
    assert_eq!(ac.read(digest).unwrap(), None);
}
