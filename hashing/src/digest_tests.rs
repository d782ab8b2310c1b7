// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::{Digest, Fingerprint, HashFunction};

#[test]
fn serialize_to_json() {
    let digest = Digest::new(
        Fingerprint::from_hex_string("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391").unwrap(),
        1,
    );
    assert_eq!(
        serde_json::to_string(&digest).unwrap(),
        "{\"fingerprint\":\"e69de29bb2d1d6434b8b29ae775ad8c2e48c5391\",\"size_bytes\":1}"
    );
}

#[test]
fn deserialize_from_json() {
    let digest = Digest::new(
        Fingerprint::from_hex_string("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391").unwrap(),
        1,
    );
    let decoded: Digest = serde_json::from_str(
        "{\"fingerprint\":\"e69de29bb2d1d6434b8b29ae775ad8c2e48c5391\",\"size_bytes\":1}",
    )
    .unwrap();
    assert_eq!(digest, decoded)
}

#[test]
fn deserialize_wrong_type() {
    serde_json::from_str::<Digest>("{\"fingerprint\":true,\"size_bytes\":1}")
        .expect_err("a bool is not a fingerprint");
}

#[test]
fn deserialize_missing_field() {
    serde_json::from_str::<Digest>(
        "{\"fingerprint\":\"e69de29bb2d1d6434b8b29ae775ad8c2e48c5391\"}",
    )
    .expect_err("size_bytes is required");
}

#[test]
fn same_content_same_digest_per_mode() {
    for mode in [HashFunction::Native, HashFunction::Compatible] {
        assert_eq!(mode.hash_blob(b"some content"), mode.hash_blob(b"some content"));
    }
}
