// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs::Permissions;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use fs::{directory, ObjectInfo, ObjectType};
use hashing::{Digest, HashFunction, WriterHasher};
use tempfile::NamedTempFile;

use crate::file_lock::FileLock;
use crate::sharded_path;

const STORE_CHUNK_SIZE: usize = 4096;

/// Permissions of committed objects: read-only, plus the exec bits in the executable shard.
const FILE_PERMS: u32 = 0o444;
const EXEC_PERMS: u32 = 0o555;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Shard {
    File,
    Executable,
    Tree,
    LargeFile,
    LargeTree,
}

impl Shard {
    fn dir_name(&self) -> &'static str {
        match self {
            Shard::File => "casf",
            Shard::Executable => "casx",
            Shard::Tree => "cast",
            Shard::LargeFile => "cas-large-f",
            Shard::LargeTree => "cas-large-t",
        }
    }

    fn permissions(&self) -> Permissions {
        match self {
            Shard::Executable => Permissions::from_mode(EXEC_PERMS),
            _ => Permissions::from_mode(FILE_PERMS),
        }
    }
}

const ALL_SHARDS: [Shard; 5] = [
    Shard::File,
    Shard::Executable,
    Shard::Tree,
    Shard::LargeFile,
    Shard::LargeTree,
];

///
/// The content-addressed object store of one generation: three object shards (files,
/// executables, trees) plus two manifest shards for split large objects, each keyed by
/// `hash[0..2]/hash[2..]`.
///
/// Readers resolve paths without any lock. Writers stage into a scratch directory on the same
/// filesystem and take the per-shard lock only around the final rename.
///
pub struct LocalCas {
    root: PathBuf,
    scratch: PathBuf,
    hash_function: HashFunction,
}

impl LocalCas {
    pub fn open(generation_root: &Path, hash_function: HashFunction) -> Result<LocalCas, String> {
        for shard in ALL_SHARDS {
            std::fs::create_dir_all(generation_root.join(shard.dir_name()))
                .map_err(|e| format!("Failed to create CAS shard {:?}: {e}", shard.dir_name()))?;
        }
        let scratch = generation_root.join("tmp");
        std::fs::create_dir_all(&scratch)
            .map_err(|e| format!("Failed to create CAS scratch dir: {e}"))?;
        Ok(LocalCas {
            root: generation_root.to_owned(),
            scratch,
            hash_function,
        })
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash_function
    }

    fn shard_root(&self, shard: Shard) -> PathBuf {
        self.root.join(shard.dir_name())
    }

    pub(crate) fn object_path_in(&self, shard: Shard, digest: Digest) -> PathBuf {
        sharded_path(&self.shard_root(shard), &digest.hash.to_hex())
    }

    ///
    /// Commit a staged temp file as `digest` in `shard`. On collision the existing object wins
    /// after a size check; the store is content-addressed, so equal digests mean equal bytes.
    ///
    fn commit(
        &self,
        shard: Shard,
        digest: Digest,
        size_bytes: u64,
        temp: NamedTempFile,
    ) -> Result<(), String> {
        let target = self.object_path_in(shard, digest);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create shard subdir {parent:?}: {e}"))?;
        }
        std::fs::set_permissions(temp.path(), shard.permissions())
            .map_err(|e| format!("Failed to set permissions on staged object: {e}"))?;

        let _shard_lock = FileLock::exclusive(&self.shard_root(shard).join(".lock"))
            .map_err(|e| format!("Failed to take shard lock: {e}"))?;
        match std::fs::metadata(&target) {
            Ok(existing) => {
                // Already stored: reuse, but verify the size so that corruption is caught at
                // the earliest point where it is observable.
                if existing.len() != size_bytes {
                    return Err(format!(
                        "Corrupt CAS object {digest:?}: stored size {} but expected {size_bytes}",
                        existing.len()
                    ));
                }
                Ok(())
            }
            Err(_) => temp
                .persist(&target)
                .map(|_| ())
                .map_err(|e| format!("Failed to persist object {digest:?}: {e}")),
        }
    }

    fn stage_temp(&self) -> Result<NamedTempFile, String> {
        NamedTempFile::new_in(&self.scratch)
            .map_err(|e| format!("Failed to create temp file in CAS scratch dir: {e}"))
    }

    /// Store a blob given in memory. Returns its digest.
    pub fn store_bytes(&self, bytes: &[u8], executable: bool) -> Result<Digest, String> {
        let digest = self.hash_function.hash_blob(bytes);
        let mut temp = self.stage_temp()?;
        temp.write_all(bytes)
            .map_err(|e| format!("Failed to stage blob: {e}"))?;
        let shard = if executable {
            Shard::Executable
        } else {
            Shard::File
        };
        self.commit(shard, digest, bytes.len() as u64, temp)?;
        Ok(digest)
    }

    /// Store a blob from a file on disk, streaming and hashing in one pass.
    pub fn store_file(&self, source: &Path, executable: bool) -> Result<Digest, String> {
        let mut file = std::fs::File::open(source)
            .map_err(|e| format!("Failed to open {source:?} for storing: {e}"))?;
        let size = file
            .metadata()
            .map_err(|e| format!("Failed to stat {source:?}: {e}"))?
            .len();

        let temp = self.stage_temp()?;
        let mut hasher = WriterHasher::new(self.hash_function.blob_hasher(size), temp);
        let mut chunk = [0_u8; STORE_CHUNK_SIZE];
        loop {
            let count = file
                .read(&mut chunk)
                .map_err(|e| format!("Failed to read {source:?}: {e}"))?;
            if count == 0 {
                break;
            }
            hasher
                .write_all(&chunk[..count])
                .map_err(|e| format!("Failed to stage {source:?}: {e}"))?;
        }
        let (digest, temp) = hasher.finish();

        let shard = if executable {
            Shard::Executable
        } else {
            Shard::File
        };
        self.commit(shard, digest, size, temp)?;
        Ok(digest)
    }

    /// Store a canonical tree payload. The payload is validated before it is committed;
    /// storing a non-canonical tree is a protocol error.
    pub fn store_tree(&self, bytes: &[u8]) -> Result<Digest, String> {
        directory::parse_tree_payload(self.hash_function, bytes)?;
        self.store_tree_unvalidated(bytes)
    }

    pub(crate) fn store_tree_unvalidated(&self, bytes: &[u8]) -> Result<Digest, String> {
        let digest = self.hash_function.hash_tree(bytes);
        let mut temp = self.stage_temp()?;
        temp.write_all(bytes)
            .map_err(|e| format!("Failed to stage tree: {e}"))?;
        self.commit(Shard::Tree, digest, bytes.len() as u64, temp)?;
        Ok(digest)
    }

    ///
    /// Ingest a payload claimed under `digest` by a peer: the shard is determined by which
    /// framing reproduces the declared hash. In compatible mode the framings coincide, so a
    /// payload that is also a canonical directory is stored as a tree as well; a payload
    /// matching neither framing is rejected.
    ///
    pub fn store_verified(&self, digest: Digest, data: &[u8]) -> Result<(), String> {
        match self.hash_function {
            HashFunction::Native => {
                if self.hash_function.hash_blob(data).hash == digest.hash {
                    self.store_bytes(data, false).map(|_| ())
                } else if self.hash_function.hash_tree(data).hash == digest.hash {
                    self.store_tree(data).map(|_| ())
                } else {
                    Err(format!(
                        "Payload does not match its declared digest {digest:?}"
                    ))
                }
            }
            HashFunction::Compatible => {
                if self.hash_function.hash_data(data).hash != digest.hash {
                    return Err(format!(
                        "Payload does not match its declared digest {digest:?}"
                    ));
                }
                self.store_bytes(data, false)?;
                if directory::parse_tree_payload(self.hash_function, data).is_ok() {
                    self.store_tree_unvalidated(data)?;
                }
                Ok(())
            }
        }
    }

    ///
    /// Read-side resolution of a blob: the path of the object with the requested executable
    /// bit, or None on miss. If the content exists only with the other bit it is promoted into
    /// the requested shard first, so returned paths always carry the right permissions.
    ///
    pub fn blob_path(&self, digest: Digest, executable: bool) -> Option<PathBuf> {
        let (wanted, other) = if executable {
            (Shard::Executable, Shard::File)
        } else {
            (Shard::File, Shard::Executable)
        };
        let path = self.object_path_in(wanted, digest);
        if path.is_file() {
            return Some(path);
        }
        let other_path = self.object_path_in(other, digest);
        if other_path.is_file() {
            return self.promote(&other_path, wanted, digest).ok();
        }
        None
    }

    /// Copy an object stored with the wrong executable bit into the requested shard.
    fn promote(&self, source: &Path, shard: Shard, digest: Digest) -> Result<PathBuf, String> {
        let mut temp = self.stage_temp()?;
        let mut file = std::fs::File::open(source)
            .map_err(|e| format!("Failed to open {source:?} for promotion: {e}"))?;
        let size = std::io::copy(&mut file, &mut temp)
            .map_err(|e| format!("Failed to promote {source:?}: {e}"))?;
        self.commit(shard, digest, size, temp)?;
        Ok(self.object_path_in(shard, digest))
    }

    pub fn tree_path(&self, digest: Digest) -> Option<PathBuf> {
        let path = self.object_path_in(Shard::Tree, digest);
        path.is_file().then_some(path)
    }

    /// The on-disk path of an object, dispatching on its type.
    pub fn object_path(&self, info: &ObjectInfo) -> Option<PathBuf> {
        match info.object_type {
            ObjectType::Tree => self.tree_path(info.digest),
            ObjectType::Executable => self.blob_path(info.digest, true),
            ObjectType::File | ObjectType::Symlink => self.blob_path(info.digest, false),
        }
    }

    pub fn has(&self, info: &ObjectInfo) -> bool {
        self.object_path(info).is_some()
    }

    /// The subset of `infos` not present locally.
    pub fn missing<'a>(
        &self,
        infos: impl IntoIterator<Item = &'a ObjectInfo>,
    ) -> Vec<ObjectInfo> {
        infos
            .into_iter()
            .filter(|info| !self.has(info))
            .copied()
            .collect()
    }

    pub fn read_blob(&self, digest: Digest) -> Result<Option<Bytes>, String> {
        match self.blob_path(digest, false) {
            Some(path) => std::fs::read(&path)
                .map(|bytes| Some(Bytes::from(bytes)))
                .map_err(|e| format!("Failed to read blob {digest:?}: {e}")),
            None => Ok(None),
        }
    }

    pub fn read_tree(&self, digest: Digest) -> Result<Option<Bytes>, String> {
        match self.tree_path(digest) {
            Some(path) => std::fs::read(&path)
                .map(|bytes| Some(Bytes::from(bytes)))
                .map_err(|e| format!("Failed to read tree {digest:?}: {e}")),
            None => Ok(None),
        }
    }

    pub fn read_object(&self, info: &ObjectInfo) -> Result<Option<Bytes>, String> {
        if info.object_type.is_tree() {
            self.read_tree(info.digest)
        } else {
            self.read_blob(info.digest)
        }
    }

    /// Stream an object into `writer` without an intermediate copy.
    pub fn dump_to_stream(
        &self,
        info: &ObjectInfo,
        writer: &mut dyn Write,
    ) -> Result<(), String> {
        let path = self
            .object_path(info)
            .ok_or_else(|| format!("Object not in CAS: {info}"))?;
        let mut file = std::fs::File::open(&path)
            .map_err(|e| format!("Failed to open object {info}: {e}"))?;
        std::io::copy(&mut file, writer)
            .map(|_| ())
            .map_err(|e| format!("Failed to dump object {info}: {e}"))
    }

    ///
    /// The actual size of a stored object. Size-unknown digests (native tree children) are
    /// completed from the blob body via this.
    ///
    pub fn object_size(&self, info: &ObjectInfo) -> Option<u64> {
        self.object_path(info)
            .and_then(|path| std::fs::metadata(path).ok())
            .map(|metadata| metadata.len())
    }
}
