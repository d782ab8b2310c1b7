// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The on-disk storage of one build root: a content-addressed object store plus the local
//! action cache and target cache, all living under a layout directory whose name encodes the
//! hash function and the storage version, so that incompatible generations never mix.

mod action_cache;
mod file_lock;
mod large;
mod local_cas;
mod target_cache;

#[cfg(test)]
mod action_cache_tests;
#[cfg(test)]
mod large_tests;
#[cfg(test)]
mod local_cas_tests;
#[cfg(test)]
mod target_cache_tests;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use action_cache::LocalActionCache;
pub use file_lock::FileLock;
pub use large::SpliceManifest;
pub use local_cas::LocalCas;
pub use target_cache::{LocalTargetCache, TargetCacheEntry, TargetCacheKey, WriteStrategy};

use hashing::{Digest, HashFunction};

/// Major version of the on-disk layout. Bumped when the layout changes incompatibly.
pub const STORAGE_VERSION: u32 = 1;

/// The directory name encoding hash function and storage version.
pub fn generation_dir_name(hash_function: HashFunction) -> String {
    let tag = match hash_function {
        HashFunction::Native => "git-sha1",
        HashFunction::Compatible => "plain-sha256",
    };
    format!("{tag}-v{STORAGE_VERSION}")
}

///
/// An error from a store operation. A missing digest is the one condition callers routinely
/// branch on: it fails the requesting action but not independent ones.
///
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StoreError {
    MissingDigest(String, Digest),
    Unclassified(String),
}

impl StoreError {
    pub fn enrich(self, prefix: &str) -> Self {
        match self {
            Self::MissingDigest(s, d) => Self::MissingDigest(format!("{prefix}: {s}"), d),
            Self::Unclassified(s) => Self::Unclassified(format!("{prefix}: {s}")),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDigest(s, d) => {
                write!(f, "{s}: {d:?}")
            }
            Self::Unclassified(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for StoreError {
    fn from(err: String) -> Self {
        Self::Unclassified(err)
    }
}

///
/// All local storage of one build root, opened under
/// `<root>/protocol-dependent/<generation>/`. Holding a `Storage` holds a shared lock on the
/// generation: garbage collection takes the exclusive lock and therefore never races a build.
///
pub struct Storage {
    hash_function: HashFunction,
    cas: Arc<LocalCas>,
    action_cache: Arc<LocalActionCache>,
    target_cache: Arc<LocalTargetCache>,
    _gc_guard: FileLock,
}

impl Storage {
    pub fn open(build_root: &Path, hash_function: HashFunction) -> Result<Storage, String> {
        let generation_root = build_root
            .join("protocol-dependent")
            .join(generation_dir_name(hash_function));
        std::fs::create_dir_all(&generation_root)
            .map_err(|e| format!("Failed to create storage root {generation_root:?}: {e}"))?;

        let gc_guard = FileLock::shared(&generation_root.join("lock"))
            .map_err(|e| format!("Failed to lock storage root {generation_root:?}: {e}"))?;

        let cas = Arc::new(LocalCas::open(&generation_root, hash_function)?);
        let action_cache = Arc::new(LocalActionCache::open(&generation_root)?);
        let target_cache = Arc::new(LocalTargetCache::open(&generation_root, cas.clone())?);

        Ok(Storage {
            hash_function,
            cas,
            action_cache,
            target_cache,
            _gc_guard: gc_guard,
        })
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash_function
    }

    pub fn cas(&self) -> &Arc<LocalCas> {
        &self.cas
    }

    pub fn action_cache(&self) -> &Arc<LocalActionCache> {
        &self.action_cache
    }

    pub fn target_cache(&self) -> &Arc<LocalTargetCache> {
        &self.target_cache
    }
}

pub(crate) fn sharded_path(root: &Path, hex: &str) -> PathBuf {
    root.join(&hex[..2]).join(&hex[2..])
}
