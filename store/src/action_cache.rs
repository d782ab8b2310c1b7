// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};

use log::warn;
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;

use hashing::Digest;

use crate::file_lock::FileLock;
use crate::sharded_path;

///
/// The local action cache: a map from action digest to serialized `ActionResult`, sharded on
/// disk like the CAS. Writes go through a temp file and a single rename under the cache lock;
/// reads are wait-free.
///
pub struct LocalActionCache {
    root: PathBuf,
    scratch: PathBuf,
}

impl LocalActionCache {
    pub fn open(generation_root: &Path) -> Result<LocalActionCache, String> {
        let root = generation_root.join("ac");
        std::fs::create_dir_all(&root)
            .map_err(|e| format!("Failed to create action cache dir: {e}"))?;
        let scratch = generation_root.join("tmp");
        std::fs::create_dir_all(&scratch)
            .map_err(|e| format!("Failed to create action cache scratch dir: {e}"))?;
        Ok(LocalActionCache { root, scratch })
    }

    fn entry_path(&self, action_digest: Digest) -> PathBuf {
        sharded_path(&self.root, &action_digest.hash.to_hex())
    }

    pub fn write(
        &self,
        action_digest: Digest,
        result: &remexec::ActionResult,
    ) -> Result<(), String> {
        let target = self.entry_path(action_digest);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create action cache subdir: {e}"))?;
        }
        let temp = tempfile::NamedTempFile::new_in(&self.scratch)
            .map_err(|e| format!("Failed to stage action cache entry: {e}"))?;
        std::fs::write(temp.path(), result.encode_to_vec())
            .map_err(|e| format!("Failed to write action cache entry: {e}"))?;

        let _lock = FileLock::exclusive(&self.root.join(".lock"))
            .map_err(|e| format!("Failed to take action cache lock: {e}"))?;
        temp.persist(&target)
            .map(|_| ())
            .map_err(|e| format!("Failed to persist action cache entry: {e}"))
    }

    ///
    /// The cached result for an action digest, or None on a miss. A corrupt entry counts as a
    /// miss: the entry will be overwritten by the re-execution it causes.
    ///
    pub fn read(&self, action_digest: Digest) -> Result<Option<remexec::ActionResult>, String> {
        let path = self.entry_path(action_digest);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("Failed to read action cache entry: {e}")),
        };
        match remexec::ActionResult::decode(&bytes[..]) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                warn!("Ignoring corrupt action cache entry for {action_digest:?}: {e}");
                Ok(None)
            }
        }
    }

    pub fn has(&self, action_digest: Digest) -> bool {
        self.entry_path(action_digest).is_file()
    }
}
