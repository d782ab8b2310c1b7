// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod directory;
pub mod git_tree;
pub mod tree_builder;

#[cfg(test)]
mod git_tree_tests;
#[cfg(test)]
mod relative_path_tests;
#[cfg(test)]
mod tree_builder_tests;

use std::fmt;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};

use hashing::Digest;
use serde::{Deserialize, Serialize};

///
/// The type of a content-addressed object. File and Executable objects share the digest of
/// their content; the executable flag is a storage hint. Symlinks are blobs whose content is
/// the link target.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    File,
    Executable,
    Tree,
    Symlink,
}

impl ObjectType {
    pub fn is_tree(&self) -> bool {
        matches!(self, ObjectType::Tree)
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, ObjectType::Executable)
    }

    pub fn from_exec_flag(is_executable: bool) -> ObjectType {
        if is_executable {
            ObjectType::Executable
        } else {
            ObjectType::File
        }
    }

    /// The git tree-entry mode for this object type, as it appears in a tree payload.
    pub fn git_mode(&self) -> &'static str {
        match self {
            ObjectType::File => "100644",
            ObjectType::Executable => "100755",
            ObjectType::Tree => "40000",
            ObjectType::Symlink => "120000",
        }
    }

    pub fn from_git_mode(mode: &str) -> Result<ObjectType, String> {
        match mode {
            "100644" => Ok(ObjectType::File),
            "100755" => Ok(ObjectType::Executable),
            "40000" => Ok(ObjectType::Tree),
            "120000" => Ok(ObjectType::Symlink),
            other => Err(format!("Unsupported git tree entry mode: {other:?}")),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectType::File => "file",
            ObjectType::Executable => "executable",
            ObjectType::Tree => "tree",
            ObjectType::Symlink => "symlink",
        };
        write!(f, "{name}")
    }
}

///
/// A digest paired with the type of the object it names: everything needed to address one
/// object in a CAS.
///
/// Digests parsed out of native (git) tree payloads are size-unknown: their `size_bytes` is
/// zero and the actual size is reconstructed from the blob body on read.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub digest: Digest,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
}

impl ObjectInfo {
    pub fn new(digest: Digest, object_type: ObjectType) -> ObjectInfo {
        ObjectInfo {
            digest,
            object_type,
        }
    }
}

impl fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}:{}]",
            self.digest.hash, self.digest.size_bytes, self.object_type
        )
    }
}

///
/// A normalized relative path: no root, no prefix, no `.`/`..` components. Parent components
/// in the input are resolved lexically and must not escape the root.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct RelativePath(PathBuf);

impl RelativePath {
    pub fn empty() -> RelativePath {
        RelativePath(PathBuf::new())
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<RelativePath, String> {
        let mut relative_path = PathBuf::new();
        let candidate = path.as_ref();
        for component in candidate.components() {
            match component {
                Component::Prefix(_) => {
                    return Err(format!("Windows paths are not allowed: {candidate:?}"))
                }
                Component::RootDir => {
                    return Err(format!("Absolute paths are not allowed: {candidate:?}"))
                }
                Component::CurDir => continue,
                Component::ParentDir => {
                    if !relative_path.pop() {
                        return Err(format!(
                            "Relative paths that escape the root are not allowed: {candidate:?}"
                        ));
                    }
                }
                Component::Normal(path) => relative_path.push(path),
            }
        }
        Ok(RelativePath(relative_path))
    }

    pub fn to_str(&self) -> Option<&str> {
        self.0.to_str()
    }

    pub fn join(&self, other: Self) -> RelativePath {
        RelativePath(self.0.join(other))
    }
}

impl Deref for RelativePath {
    type Target = PathBuf;

    fn deref(&self) -> &PathBuf {
        &self.0
    }
}

impl AsRef<Path> for RelativePath {
    fn as_ref(&self) -> &Path {
        self.0.as_path()
    }
}

impl From<RelativePath> for PathBuf {
    fn from(p: RelativePath) -> Self {
        p.0
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

///
/// Whether a symlink target is relative and stays inside the directory containing the link.
/// Upward-escaping targets are rejected by default when collecting action outputs.
///
pub fn is_non_upwards_symlink_target(target: &str) -> bool {
    if target.is_empty() || target.starts_with('/') {
        return false;
    }
    let mut depth = 0_i64;
    for component in Path::new(target).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}
