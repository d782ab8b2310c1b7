// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use hashing::HashFunction;

use crate::directory::{parse_tree_payload, TreeChild};
use crate::tree_builder::{CollectingSink, DirectoryTree, TreeEntry};
use crate::{ObjectInfo, ObjectType, RelativePath};

fn blob(content: &[u8], hash_function: HashFunction) -> TreeEntry {
    TreeEntry::Blob {
        digest: hash_function.hash_blob(content),
        executable: false,
    }
}

#[test]
fn nested_native_tree_matches_git() {
    // Equivalent to a git repository holding only `sub/test.txt` with the Pro Git sample blob.
    let hash_function = HashFunction::Native;
    let tree = DirectoryTree::from_entries(vec![(
        RelativePath::new("sub/test.txt").unwrap(),
        blob(b"test content\n", hash_function),
    )])
    .unwrap();

    let mut sink = CollectingSink::default();
    let root = tree.write(hash_function, &mut sink).unwrap();

    // Inner tree first, then the root: children always precede parents.
    assert_eq!(sink.trees.len(), 2);
    assert_eq!(
        sink.trees[0].0.hash.to_hex(),
        "d8329fc1cc938780ffdd9f94e0d364e0ea74f579"
    );
    assert_eq!(sink.trees[1].0, root);
}

#[test]
fn compatible_tree_children_round_trip() {
    let hash_function = HashFunction::Compatible;
    let file = hash_function.hash_blob(b"contents");
    let tree = DirectoryTree::from_entries(vec![
        (
            RelativePath::new("a.txt").unwrap(),
            TreeEntry::Blob {
                digest: file,
                executable: false,
            },
        ),
        (
            RelativePath::new("bin/tool").unwrap(),
            TreeEntry::Blob {
                digest: file,
                executable: true,
            },
        ),
        (
            RelativePath::new("link").unwrap(),
            TreeEntry::Symlink {
                target: "a.txt".to_string(),
            },
        ),
    ])
    .unwrap();

    let mut sink = CollectingSink::default();
    let root = tree.write(hash_function, &mut sink).unwrap();
    let (_, root_payload) = sink
        .trees
        .iter()
        .find(|(digest, _)| *digest == root)
        .unwrap();

    let children = parse_tree_payload(hash_function, root_payload).unwrap();
    assert_eq!(
        children,
        vec![
            TreeChild::Object {
                name: "a.txt".to_string(),
                info: ObjectInfo::new(file, ObjectType::File),
            },
            TreeChild::Object {
                name: "bin".to_string(),
                info: ObjectInfo::new(sink.trees[0].0, ObjectType::Tree),
            },
            TreeChild::Symlink {
                name: "link".to_string(),
                target: "a.txt".to_string(),
            },
        ]
    );
}

#[test]
fn native_symlinks_become_blobs() {
    let hash_function = HashFunction::Native;
    let tree = DirectoryTree::from_entries(vec![(
        RelativePath::new("link").unwrap(),
        TreeEntry::Symlink {
            target: "some/target".to_string(),
        },
    )])
    .unwrap();

    let mut sink = CollectingSink::default();
    let root = tree.write(hash_function, &mut sink).unwrap();

    let expected = hash_function.hash_blob(b"some/target");
    assert_eq!(sink.blobs, vec![(expected, "some/target".into())]);

    let (_, payload) = sink.trees.iter().find(|(d, _)| *d == root).unwrap();
    let children = parse_tree_payload(hash_function, payload).unwrap();
    match &children[..] {
        [TreeChild::Object { name, info }] => {
            assert_eq!(name, "link");
            assert_eq!(info.object_type, ObjectType::Symlink);
            assert_eq!(info.digest.hash, expected.hash);
        }
        other => panic!("unexpected children: {other:?}"),
    }
}

#[test]
fn conflicting_entries_are_rejected() {
    let hash_function = HashFunction::Compatible;
    DirectoryTree::from_entries(vec![
        (
            RelativePath::new("path").unwrap(),
            blob(b"a", hash_function),
        ),
        (
            RelativePath::new("path/below").unwrap(),
            blob(b"b", hash_function),
        ),
    ])
    .expect_err("a leaf cannot also be a directory");

    DirectoryTree::from_entries(vec![
        (
            RelativePath::new("path").unwrap(),
            blob(b"a", hash_function),
        ),
        (
            RelativePath::new("path").unwrap(),
            blob(b"b", hash_function),
        ),
    ])
    .expect_err("two leaves cannot share a path");
}

#[test]
fn empty_tree_digests() {
    for hash_function in [HashFunction::Native, HashFunction::Compatible] {
        let mut sink = CollectingSink::default();
        let root = DirectoryTree::new().write(hash_function, &mut sink).unwrap();
        assert_eq!(root, hash_function.empty_tree_digest());
    }
}
