// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use fs::ObjectInfo;
use hashing::Digest;

use crate::file_lock::FileLock;
use crate::local_cas::LocalCas;
use crate::sharded_path;

///
/// The key of a target-cache entry: the digest of the canonical JSON naming an export target
/// under an effective configuration within a fingerprinted repository. The JSON itself is
/// stored as a CAS blob, so a key in hand can always be explained.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TargetCacheKey(pub Digest);

#[derive(Serialize)]
struct TargetCacheKeyDescription<'a> {
    repo_key: &'a str,
    target_name: &'a str,
    effective_config: String,
}

impl TargetCacheKey {
    pub fn create(
        cas: &LocalCas,
        repo_key: &str,
        target_name: &str,
        effective_config: &serde_json::Value,
    ) -> Result<TargetCacheKey, String> {
        let description = TargetCacheKeyDescription {
            repo_key,
            target_name,
            effective_config: effective_config.to_string(),
        };
        let json = serde_json::to_vec(&description)
            .map_err(|e| format!("Failed to serialize target cache key: {e}"))?;
        let digest = cas.store_bytes(&json, false)?;
        Ok(TargetCacheKey(digest))
    }
}

///
/// One target-cache entry: the artifacts, runfiles and providers of an analysed export
/// target, all by name, plus the export targets its analysis implied. Every referenced digest
/// must be known to the store the entry lives in.
///
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TargetCacheEntry {
    pub artifacts: BTreeMap<String, ObjectInfo>,
    pub runfiles: BTreeMap<String, ObjectInfo>,
    pub provides: BTreeMap<String, ObjectInfo>,
    #[serde(
        rename = "implied export targets",
        default,
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub implied_export_targets: BTreeSet<String>,
}

impl TargetCacheEntry {
    /// Every object this entry references; exactly the set that must be resident before the
    /// entry itself is written.
    pub fn referenced_objects(&self) -> Vec<ObjectInfo> {
        self.artifacts
            .values()
            .chain(self.runfiles.values())
            .chain(self.provides.values())
            .copied()
            .collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| format!("Failed to serialize target cache entry: {e}"))
    }

    pub fn from_json(bytes: &[u8]) -> Result<TargetCacheEntry, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("Invalid target cache entry: {e}"))
    }
}

/// How a target-cache write is performed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteStrategy {
    /// Do not write at all.
    Disabled,
    /// Write before returning.
    Sync,
    /// Write in the background; failures are logged, not reported.
    Async,
}

///
/// The local target cache: a sharded map from key digest to the digest of the entry blob. The
/// entry itself lives in the CAS, so readers resolve it like any other object.
///
pub struct LocalTargetCache {
    root: PathBuf,
    scratch: PathBuf,
    cas: Arc<LocalCas>,
}

impl LocalTargetCache {
    pub fn open(generation_root: &Path, cas: Arc<LocalCas>) -> Result<LocalTargetCache, String> {
        let root = generation_root.join("tc");
        std::fs::create_dir_all(&root)
            .map_err(|e| format!("Failed to create target cache dir: {e}"))?;
        let scratch = generation_root.join("tmp");
        std::fs::create_dir_all(&scratch)
            .map_err(|e| format!("Failed to create target cache scratch dir: {e}"))?;
        Ok(LocalTargetCache { root, scratch, cas })
    }

    fn entry_path(&self, key: TargetCacheKey) -> PathBuf {
        sharded_path(&self.root, &key.0.hash.to_hex())
    }

    pub fn write(
        self: &Arc<Self>,
        key: TargetCacheKey,
        entry: &TargetCacheEntry,
        strategy: WriteStrategy,
    ) -> Result<(), String> {
        match strategy {
            WriteStrategy::Disabled => Ok(()),
            WriteStrategy::Sync => self.write_now(key, entry),
            WriteStrategy::Async => {
                let this = self.clone();
                let entry = entry.clone();
                std::thread::spawn(move || {
                    if let Err(e) = this.write_now(key, &entry) {
                        warn!("Asynchronous target cache write failed: {e}");
                    }
                });
                Ok(())
            }
        }
    }

    fn write_now(&self, key: TargetCacheKey, entry: &TargetCacheEntry) -> Result<(), String> {
        // An entry must be self-contained at the time it becomes visible.
        for info in entry.referenced_objects() {
            if !self.cas.has(&info) {
                return Err(format!(
                    "Refusing to write target cache entry referencing unknown object {info}"
                ));
            }
        }
        let entry_digest = self.cas.store_bytes(&entry.to_json()?, false)?;

        let target = self.entry_path(key);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create target cache subdir: {e}"))?;
        }
        let temp = tempfile::NamedTempFile::new_in(&self.scratch)
            .map_err(|e| format!("Failed to stage target cache entry: {e}"))?;
        std::fs::write(
            temp.path(),
            format!("{}:{}", entry_digest.hash.to_hex(), entry_digest.size_bytes),
        )
        .map_err(|e| format!("Failed to write target cache pointer: {e}"))?;

        let _lock = FileLock::exclusive(&self.root.join(".lock"))
            .map_err(|e| format!("Failed to take target cache lock: {e}"))?;
        temp.persist(&target)
            .map(|_| ())
            .map_err(|e| format!("Failed to persist target cache entry: {e}"))
    }

    /// The digest of the entry blob recorded for `key`, if any.
    pub fn read_entry_digest(&self, key: TargetCacheKey) -> Result<Option<Digest>, String> {
        let path = self.entry_path(key);
        let pointer = match std::fs::read_to_string(&path) {
            Ok(pointer) => pointer,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("Failed to read target cache entry: {e}")),
        };
        let (hex, size) = pointer
            .split_once(':')
            .ok_or_else(|| format!("Corrupt target cache pointer: {pointer:?}"))?;
        let digest = Digest::new(
            hashing::Fingerprint::from_hex_string(hex)?,
            size.parse::<usize>()
                .map_err(|e| format!("Corrupt target cache pointer size: {e}"))?,
        );
        Ok(Some(digest))
    }

    pub fn read(&self, key: TargetCacheKey) -> Result<Option<TargetCacheEntry>, String> {
        let Some(entry_digest) = self.read_entry_digest(key)? else {
            return Ok(None);
        };
        let Some(bytes) = self.cas.read_blob(entry_digest)? else {
            warn!("Target cache entry blob missing from CAS for key {key:?}; treating as miss");
            return Ok(None);
        };
        TargetCacheEntry::from_json(&bytes).map(Some)
    }
}
