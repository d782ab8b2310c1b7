// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Helpers over the two canonical directory payloads: git trees in native mode and
//! `remote_execution.Directory` messages in compatible mode.

use hashing::{Digest, HashFunction};
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::verify_directory_canonical;

use crate::{git_tree, ObjectInfo, ObjectType};

/// One child of a parsed tree payload. In native mode symlinks are blobs like any other child;
/// in compatible mode the target string is inlined in the directory message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeChild {
    Object { name: String, info: ObjectInfo },
    Symlink { name: String, target: String },
}

impl TreeChild {
    pub fn name(&self) -> &str {
        match self {
            TreeChild::Object { name, .. } => name,
            TreeChild::Symlink { name, .. } => name,
        }
    }
}

///
/// Parse a canonical tree payload into its children, dispatching on the hash function that
/// produced it. Non-canonical payloads are protocol errors.
///
pub fn parse_tree_payload(
    hash_function: HashFunction,
    payload: &[u8],
) -> Result<Vec<TreeChild>, String> {
    match hash_function {
        HashFunction::Native => {
            let entries = git_tree::parse(payload)?;
            Ok(entries
                .into_iter()
                .map(|entry| TreeChild::Object {
                    name: entry.name,
                    // Git tree entries do not record sizes: children are size-unknown until
                    // their blob body is read.
                    info: ObjectInfo::new(Digest::new(entry.id, 0), entry.object_type),
                })
                .collect())
        }
        HashFunction::Compatible => {
            let directory = decode_directory(hash_function.hash_tree(payload), payload)?;
            let mut children = Vec::new();
            for node in &directory.files {
                let digest = protos::require_digest(node.digest.as_ref())?;
                children.push(TreeChild::Object {
                    name: node.name.clone(),
                    info: ObjectInfo::new(digest, ObjectType::from_exec_flag(node.is_executable)),
                });
            }
            for node in &directory.directories {
                let digest = protos::require_digest(node.digest.as_ref())?;
                children.push(TreeChild::Object {
                    name: node.name.clone(),
                    info: ObjectInfo::new(digest, ObjectType::Tree),
                });
            }
            for node in &directory.symlinks {
                children.push(TreeChild::Symlink {
                    name: node.name.clone(),
                    target: node.target.clone(),
                });
            }
            Ok(children)
        }
    }
}

/// Decode and verify a `Directory` message.
pub fn decode_directory(digest: Digest, payload: &[u8]) -> Result<remexec::Directory, String> {
    let directory = remexec::Directory::decode(payload)
        .map_err(|e| format!("Corrupt Directory {digest:?}: {e}"))?;
    verify_directory_canonical(digest, &directory)?;
    Ok(directory)
}

/// Canonical serialization of a `Directory` message.
pub fn directory_to_bytes(directory: &remexec::Directory) -> Vec<u8> {
    directory.encode_to_vec()
}
