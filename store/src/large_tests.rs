// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use hashing::HashFunction;

use crate::large::chunk_boundaries;
use crate::LocalCas;

fn new_cas() -> (tempfile::TempDir, LocalCas) {
    let dir = tempfile::tempdir().unwrap();
    let cas = LocalCas::open(dir.path(), HashFunction::Compatible).unwrap();
    (dir, cas)
}

/// Deterministic pseudo-random payload, long enough to produce several chunks.
fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x243f_6a88_85a3_08d3_u64;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

#[test]
fn boundaries_cover_payload_exactly() {
    let data = payload(5 * 1024 * 1024);
    let boundaries = chunk_boundaries(&data);
    assert!(boundaries.len() > 1);
    let mut expected_start = 0;
    for (start, end) in &boundaries {
        assert_eq!(*start, expected_start);
        assert!(end > start);
        assert!(end - start <= 2 * 1024 * 1024);
        expected_start = *end;
    }
    assert_eq!(expected_start, data.len());
}

#[test]
fn boundaries_are_content_defined() {
    // Prepending bytes shifts early chunks but re-synchronizes: most chunks of the shifted
    // payload also occur in the original, which is the property deduplication relies on.
    let data = payload(6 * 1024 * 1024);
    let mut shifted = payload(1024);
    shifted.extend_from_slice(&data);

    let original: std::collections::HashSet<Vec<u8>> = chunk_boundaries(&data)
        .into_iter()
        .map(|(s, e)| data[s..e].to_vec())
        .collect();
    let shared = chunk_boundaries(&shifted)
        .into_iter()
        .filter(|(s, e)| original.contains(&shifted[*s..*e]))
        .count();
    assert!(shared >= 2, "expected chunk re-synchronization, got {shared} shared chunks");
}

#[test]
fn split_then_splice_round_trips() {
    let (_dir, cas) = new_cas();
    let data = payload(5 * 1024 * 1024);
    let digest = cas.store_bytes(&data, false).unwrap();

    let manifest = cas.split(digest, false).unwrap();
    assert!(manifest.chunks.len() > 1);
    assert_eq!(cas.load_manifest(digest, false).unwrap().unwrap(), manifest);

    // Simulate a fresh store that has the chunks but not the whole object.
    let (_dir2, other) = new_cas();
    for chunk in &manifest.chunks {
        let bytes = cas.read_blob(*chunk).unwrap().unwrap();
        other.store_bytes(&bytes, false).unwrap();
    }
    let spliced = other.splice(digest, false, &manifest).unwrap();
    assert_eq!(spliced, digest);
    assert_eq!(other.read_blob(digest).unwrap().unwrap(), data);
}

#[test]
fn splice_verifies_the_result() {
    let (_dir, cas) = new_cas();
    let data = payload(5 * 1024 * 1024);
    let digest = cas.store_bytes(&data, false).unwrap();
    let mut manifest = cas.split(digest, false).unwrap();

    // Drop a chunk: the reassembled payload no longer matches the expected digest.
    manifest.chunks.pop();
    cas.splice(digest, false, &manifest)
        .expect_err("splice must verify the reassembled digest");
}

#[test]
fn small_objects_are_one_chunk() {
    let data = payload(16 * 1024);
    assert_eq!(chunk_boundaries(&data), vec![(0, data.len())]);
}
