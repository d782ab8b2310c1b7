// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Builds the input root of an action: a nested directory structure assembled from
//! root-relative paths, serialized bottom-up into whichever canonical tree payload the active
//! hash function calls for.

use std::collections::BTreeMap;

use bytes::Bytes;
use hashing::{Digest, HashFunction};
use protos::gen::build::bazel::remote::execution::v2 as remexec;

use crate::{directory, git_tree, ObjectType, RelativePath};

/// A leaf placed into a directory tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeEntry {
    Blob { digest: Digest, executable: bool },
    Tree { digest: Digest },
    Symlink { target: String },
}

/// Receives every object produced while serializing a tree, so callers can persist or upload
/// them as they are created.
pub trait TreeSink {
    /// Called for blobs synthesized during serialization (symlink targets in native mode).
    fn store_blob(&mut self, digest: Digest, bytes: Bytes) -> Result<(), String>;
    /// Called for every directory payload, children before parents.
    fn store_tree(&mut self, digest: Digest, bytes: Bytes) -> Result<(), String>;
}

#[derive(Clone, Debug)]
enum Node {
    Leaf(TreeEntry),
    Dir(DirectoryTree),
}

///
/// An in-memory directory hierarchy, keyed by single path segments.
///
#[derive(Clone, Debug, Default)]
pub struct DirectoryTree {
    entries: BTreeMap<String, Node>,
}

impl DirectoryTree {
    pub fn new() -> DirectoryTree {
        DirectoryTree::default()
    }

    ///
    /// Assemble a tree from root-relative leaf paths. Placing a leaf where a directory already
    /// exists (or vice versa), or placing two leaves at one path, is an error.
    ///
    pub fn from_entries(
        items: impl IntoIterator<Item = (RelativePath, TreeEntry)>,
    ) -> Result<DirectoryTree, String> {
        let mut root = DirectoryTree::new();
        for (path, entry) in items {
            root.insert(&path, entry)?;
        }
        Ok(root)
    }

    pub fn insert(&mut self, path: &RelativePath, entry: TreeEntry) -> Result<(), String> {
        let segments: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if segments.is_empty() {
            return Err("Cannot insert an entry at the tree root".to_string());
        }
        self.insert_segments(&segments, entry, path)
    }

    fn insert_segments(
        &mut self,
        segments: &[String],
        entry: TreeEntry,
        full_path: &RelativePath,
    ) -> Result<(), String> {
        let (head, rest) = segments.split_first().expect("non-empty segments");
        if rest.is_empty() {
            if self.entries.contains_key(head) {
                return Err(format!("Conflicting tree entries at {full_path}"));
            }
            self.entries.insert(head.clone(), Node::Leaf(entry));
            return Ok(());
        }
        match self
            .entries
            .entry(head.clone())
            .or_insert_with(|| Node::Dir(DirectoryTree::new()))
        {
            Node::Dir(subdir) => subdir.insert_segments(rest, entry, full_path),
            Node::Leaf(_) => Err(format!(
                "Tree entry {full_path} traverses a non-directory at {head:?}"
            )),
        }
    }

    ///
    /// Serialize bottom-up and return the root tree digest. Every produced object is handed to
    /// `sink` before its parent, so a sink that uploads as it goes never references an object
    /// it has not yet seen.
    ///
    pub fn write(
        &self,
        hash_function: HashFunction,
        sink: &mut dyn TreeSink,
    ) -> Result<Digest, String> {
        match hash_function {
            HashFunction::Native => self.write_git(hash_function, sink),
            HashFunction::Compatible => self.write_proto(hash_function, sink),
        }
    }

    fn write_git(
        &self,
        hash_function: HashFunction,
        sink: &mut dyn TreeSink,
    ) -> Result<Digest, String> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (name, node) in &self.entries {
            let (object_type, digest) = match node {
                Node::Dir(subdir) => (ObjectType::Tree, subdir.write_git(hash_function, sink)?),
                Node::Leaf(TreeEntry::Blob { digest, executable }) => {
                    (ObjectType::from_exec_flag(*executable), *digest)
                }
                Node::Leaf(TreeEntry::Tree { digest }) => (ObjectType::Tree, *digest),
                Node::Leaf(TreeEntry::Symlink { target }) => {
                    let digest = hash_function.hash_blob(target.as_bytes());
                    sink.store_blob(digest, Bytes::copy_from_slice(target.as_bytes()))?;
                    (ObjectType::Symlink, digest)
                }
            };
            entries.push(git_tree::GitTreeEntry {
                name: name.clone(),
                object_type,
                id: digest.hash,
            });
        }
        let payload = git_tree::encode(entries)?;
        let digest = hash_function.hash_tree(&payload);
        sink.store_tree(digest, Bytes::from(payload))?;
        Ok(digest)
    }

    fn write_proto(
        &self,
        hash_function: HashFunction,
        sink: &mut dyn TreeSink,
    ) -> Result<Digest, String> {
        let mut files = Vec::new();
        let mut directories = Vec::new();
        let mut symlinks = Vec::new();
        for (name, node) in &self.entries {
            match node {
                Node::Dir(subdir) => {
                    let digest = subdir.write_proto(hash_function, sink)?;
                    directories.push(remexec::DirectoryNode {
                        name: name.clone(),
                        digest: Some(digest.into()),
                    });
                }
                Node::Leaf(TreeEntry::Blob { digest, executable }) => {
                    files.push(remexec::FileNode {
                        name: name.clone(),
                        digest: Some((*digest).into()),
                        is_executable: *executable,
                        ..remexec::FileNode::default()
                    });
                }
                Node::Leaf(TreeEntry::Tree { digest }) => {
                    directories.push(remexec::DirectoryNode {
                        name: name.clone(),
                        digest: Some((*digest).into()),
                    });
                }
                Node::Leaf(TreeEntry::Symlink { target }) => {
                    symlinks.push(remexec::SymlinkNode {
                        name: name.clone(),
                        target: target.clone(),
                        ..remexec::SymlinkNode::default()
                    });
                }
            }
        }
        let directory = remexec::Directory {
            files,
            directories,
            symlinks,
            ..remexec::Directory::default()
        };
        let payload = directory::directory_to_bytes(&directory);
        let digest = hash_function.hash_tree(&payload);
        sink.store_tree(digest, Bytes::from(payload))?;
        Ok(digest)
    }
}

/// A sink that keeps every produced object in memory, for callers that upload in one pass.
#[derive(Default)]
pub struct CollectingSink {
    pub blobs: Vec<(Digest, Bytes)>,
    pub trees: Vec<(Digest, Bytes)>,
}

impl TreeSink for CollectingSink {
    fn store_blob(&mut self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        self.blobs.push((digest, bytes));
        Ok(())
    }

    fn store_tree(&mut self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        self.trees.push((digest, bytes));
        Ok(())
    }
}
