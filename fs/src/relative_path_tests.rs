// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;

use crate::{is_non_upwards_symlink_target, RelativePath};

#[test]
fn normalizes_lexically() {
    assert_eq!(
        PathBuf::from(RelativePath::new("a/./b").unwrap()),
        PathBuf::from("a/b")
    );
    assert_eq!(
        PathBuf::from(RelativePath::new("a/sub/../b").unwrap()),
        PathBuf::from("a/b")
    );
    assert_eq!(
        PathBuf::from(RelativePath::new("./out.txt").unwrap()),
        PathBuf::from("out.txt")
    );
}

#[test]
fn rejects_absolute_paths() {
    RelativePath::new("/etc/passwd").expect_err("absolute paths must be rejected");
}

#[test]
fn rejects_upward_escapes() {
    RelativePath::new("..").expect_err("plain parent dir escapes the root");
    RelativePath::new("a/../../b").expect_err("escape via parent dirs must be rejected");
}

#[test]
fn empty_after_normalization_is_allowed() {
    assert_eq!(PathBuf::from(RelativePath::new("a/..").unwrap()), PathBuf::new());
    assert_eq!(PathBuf::from(RelativePath::empty()), PathBuf::new());
}

#[test]
fn symlink_targets() {
    assert!(is_non_upwards_symlink_target("file"));
    assert!(is_non_upwards_symlink_target("sub/dir/file"));
    assert!(is_non_upwards_symlink_target("sub/../file"));
    assert!(!is_non_upwards_symlink_target("../sibling"));
    assert!(!is_non_upwards_symlink_target("sub/../../file"));
    assert!(!is_non_upwards_symlink_target("/abs"));
    assert!(!is_non_upwards_symlink_target(""));
}
