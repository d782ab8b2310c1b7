// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use hashing::{Fingerprint, HashFunction};

use crate::git_tree::{encode, parse, GitTreeEntry};
use crate::ObjectType;

fn blob_id(hex: &str) -> Fingerprint {
    Fingerprint::from_hex_string(hex).unwrap()
}

#[test]
fn single_file_tree_matches_git_write_tree() {
    // `git update-index --add --cacheinfo 100644 d670460b... test.txt && git write-tree`
    let payload = encode(vec![GitTreeEntry {
        name: "test.txt".to_string(),
        object_type: ObjectType::File,
        id: blob_id("d670460b4b4aece5915caf5c68d12f560a9fe3e4"),
    }])
    .unwrap();
    let digest = HashFunction::Native.hash_tree(&payload);
    assert_eq!(digest.hash.to_hex(), "d8329fc1cc938780ffdd9f94e0d364e0ea74f579");
}

#[test]
fn trees_sort_with_trailing_slash() {
    // git compares tree entries as if their name ended in '/': "a.txt" sorts before the
    // subtree "a".
    let file = GitTreeEntry {
        name: "a.txt".to_string(),
        object_type: ObjectType::File,
        id: blob_id("d670460b4b4aece5915caf5c68d12f560a9fe3e4"),
    };
    let tree = GitTreeEntry {
        name: "a".to_string(),
        object_type: ObjectType::Tree,
        id: blob_id("4b825dc642cb6eb9a060e54bf8d69288fbee4904"),
    };
    let payload = encode(vec![tree.clone(), file.clone()]).unwrap();
    assert_eq!(parse(&payload).unwrap(), vec![file, tree]);
}

#[test]
fn round_trip_preserves_entries() {
    let entries = vec![
        GitTreeEntry {
            name: "bin".to_string(),
            object_type: ObjectType::Executable,
            id: blob_id("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"),
        },
        GitTreeEntry {
            name: "link".to_string(),
            object_type: ObjectType::Symlink,
            id: blob_id("d670460b4b4aece5915caf5c68d12f560a9fe3e4"),
        },
        GitTreeEntry {
            name: "sub".to_string(),
            object_type: ObjectType::Tree,
            id: blob_id("4b825dc642cb6eb9a060e54bf8d69288fbee4904"),
        },
    ];
    let payload = encode(entries.clone()).unwrap();
    assert_eq!(parse(&payload).unwrap(), entries);
}

#[test]
fn rejects_duplicate_names() {
    let entry = GitTreeEntry {
        name: "same".to_string(),
        object_type: ObjectType::File,
        id: blob_id("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"),
    };
    encode(vec![entry.clone(), entry]).expect_err("duplicate names must be rejected");
}

#[test]
fn rejects_invalid_names() {
    for name in ["", ".", "..", "a/b", "nul\0byte"] {
        encode(vec![GitTreeEntry {
            name: name.to_string(),
            object_type: ObjectType::File,
            id: blob_id("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"),
        }])
        .expect_err("invalid name must be rejected");
    }
}

#[test]
fn parse_rejects_unsorted_payloads() {
    let b = encode(vec![GitTreeEntry {
        name: "b".to_string(),
        object_type: ObjectType::File,
        id: blob_id("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"),
    }])
    .unwrap();
    let a = encode(vec![GitTreeEntry {
        name: "a".to_string(),
        object_type: ObjectType::File,
        id: blob_id("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"),
    }])
    .unwrap();
    let mut swapped = b;
    swapped.extend_from_slice(&a);
    parse(&swapped).expect_err("unsorted payload is not canonical");
}

#[test]
fn parse_rejects_truncation() {
    let payload = encode(vec![GitTreeEntry {
        name: "f".to_string(),
        object_type: ObjectType::File,
        id: blob_id("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"),
    }])
    .unwrap();
    parse(&payload[..payload.len() - 1]).expect_err("truncated payload must be rejected");
}
