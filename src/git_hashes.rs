// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use log::warn;
use parking_lot::RwLock;

use hashing::HashFunction;

///
/// A bridge between git identifiers and compatible digests: in compatible mode, sources that
/// arrive already fingerprinted by git are re-hashed with SHA256 and the association is kept,
/// so that git-addressed metadata can still be resolved. The table belongs to one build
/// context; a new invocation starts empty.
///
#[derive(Default)]
pub struct GitHashesConverter {
    git_to_compatible: RwLock<HashMap<String, String>>,
    compatible_to_git: RwLock<HashMap<String, (String, String)>>,
}

impl GitHashesConverter {
    pub fn new() -> GitHashesConverter {
        GitHashesConverter::default()
    }

    ///
    /// Record `data` (already known under `git_hash` in `repo`) and return its compatible
    /// hash. Only meaningful in compatible mode.
    ///
    pub fn register_git_entry(&self, git_hash: &str, data: &[u8], repo: &str) -> String {
        {
            let forward = self.git_to_compatible.read();
            if let Some(existing) = forward.get(git_hash) {
                return existing.clone();
            }
        }
        let compatible_hash = HashFunction::Compatible.hash_data(data).hash.to_hex();
        self.git_to_compatible
            .write()
            .insert(git_hash.to_string(), compatible_hash.clone());
        self.compatible_to_git.write().insert(
            compatible_hash.clone(),
            (git_hash.to_string(), repo.to_string()),
        );
        compatible_hash
    }

    /// The git hash and repository a compatible hash was registered from, if any.
    pub fn get_git_entry(&self, compatible_hash: &str) -> Option<(String, String)> {
        let entry = self.compatible_to_git.read().get(compatible_hash).cloned();
        if entry.is_none() {
            warn!("Unable to get the git-sha1 code associated to {compatible_hash}");
        }
        entry
    }
}
