// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::gen::build::bazel::remote::execution::v2 as remexec;
use crate::verify_directory_canonical;
use hashing::{Digest, Fingerprint};

fn empty_digest() -> Digest {
    Digest::new(
        Fingerprint::from_hex_string(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap(),
        0,
    )
}

fn file_node(name: &str) -> remexec::FileNode {
    remexec::FileNode {
        name: name.to_owned(),
        digest: Some(empty_digest().into()),
        ..remexec::FileNode::default()
    }
}

fn directory_node(name: &str) -> remexec::DirectoryNode {
    remexec::DirectoryNode {
        name: name.to_owned(),
        digest: Some(empty_digest().into()),
    }
}

fn symlink_node(name: &str, target: &str) -> remexec::SymlinkNode {
    remexec::SymlinkNode {
        name: name.to_owned(),
        target: target.to_owned(),
    }
}

#[test]
fn empty_directory_is_canonical() {
    verify_directory_canonical(empty_digest(), &remexec::Directory::default()).unwrap();
}

#[test]
fn canonical_directory_is_accepted() {
    let directory = remexec::Directory {
        files: vec![file_node("roland"), file_node("simba")],
        directories: vec![directory_node("cats"), directory_node("dogs")],
        symlinks: vec![symlink_node("alias", "roland")],
        ..remexec::Directory::default()
    };
    verify_directory_canonical(empty_digest(), &directory).unwrap();
}

#[test]
fn unsorted_files_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file_node("simba"), file_node("roland")],
        ..remexec::Directory::default()
    };
    let err = verify_directory_canonical(empty_digest(), &directory)
        .expect_err("unsorted files are not canonical");
    assert!(err.contains("must be sorted"));
}

#[test]
fn duplicate_files_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file_node("roland"), file_node("roland")],
        ..remexec::Directory::default()
    };
    verify_directory_canonical(empty_digest(), &directory)
        .expect_err("duplicate file names are not canonical");
}

#[test]
fn file_and_directory_with_same_name_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file_node("roland")],
        directories: vec![directory_node("roland")],
        ..remexec::Directory::default()
    };
    let err = verify_directory_canonical(empty_digest(), &directory)
        .expect_err("a name must have exactly one type");
    assert!(err.contains("more than one type"));
}

#[test]
fn file_and_symlink_with_same_name_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file_node("roland")],
        symlinks: vec![symlink_node("roland", "elsewhere")],
        ..remexec::Directory::default()
    };
    verify_directory_canonical(empty_digest(), &directory)
        .expect_err("a name must have exactly one type");
}

#[test]
fn multi_segment_names_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file_node("pets/roland")],
        ..remexec::Directory::default()
    };
    let err = verify_directory_canonical(empty_digest(), &directory)
        .expect_err("child names must be single path segments");
    assert!(err.contains("one path segment"));
}

#[test]
fn empty_names_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file_node("")],
        ..remexec::Directory::default()
    };
    let err = verify_directory_canonical(empty_digest(), &directory)
        .expect_err("empty child names are not canonical");
    assert!(err.contains("must not be empty"));
}
