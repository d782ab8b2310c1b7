// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Large-object support: objects above a threshold are partitioned into content-defined
//! chunks and reassembled through a splice manifest stored in the `cas-large-*` shards. The
//! chunks themselves are ordinary blobs, so identical regions of large objects deduplicate.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use hashing::Digest;

use crate::local_cas::{LocalCas, Shard};

/// Objects at or above this size are worth splitting.
#[allow(dead_code)]
pub const LARGE_OBJECT_THRESHOLD: usize = 4 * 1024 * 1024;

const MIN_CHUNK_SIZE: usize = 512 * 1024;
const AVG_CHUNK_SIZE: usize = 1024 * 1024;
const MAX_CHUNK_SIZE: usize = 2 * 1024 * 1024;

// Chunking masks: more bits before the average-size point (harder to cut), fewer after, which
// concentrates chunk sizes around the average.
const MASK_HARD: u64 = (1 << 21) - 1;
const MASK_EASY: u64 = (1 << 17) - 1;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

lazy_static! {
    // A fixed gear table; regenerating it from a constant seed keeps chunk boundaries stable
    // across processes, which the digest-addressed manifests rely on.
    static ref GEAR: [u64; 256] = {
        let mut table = [0_u64; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = splitmix64(i as u64);
        }
        table
    };
}

/// The next cut point in `data`: FastCDC-style gear hashing with normalized chunk sizes.
fn cut_point(data: &[u8]) -> usize {
    if data.len() <= MIN_CHUNK_SIZE {
        return data.len();
    }
    let upper = data.len().min(MAX_CHUNK_SIZE);
    let normal = AVG_CHUNK_SIZE.min(upper);
    let mut hash: u64 = 0;
    for (i, byte) in data.iter().enumerate().take(upper).skip(MIN_CHUNK_SIZE) {
        hash = (hash << 1).wrapping_add(GEAR[*byte as usize]);
        let mask = if i < normal { MASK_HARD } else { MASK_EASY };
        if hash & mask == 0 {
            return i + 1;
        }
    }
    upper
}

/// Content-defined chunk boundaries of `data`, in order. Every byte belongs to exactly one
/// chunk; chunk sizes fall in `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]` except for the final chunk.
pub(crate) fn chunk_boundaries(data: &[u8]) -> Vec<(usize, usize)> {
    let mut boundaries = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let len = cut_point(&data[offset..]);
        boundaries.push((offset, offset + len));
        offset += len;
    }
    boundaries
}

///
/// The reassembly recipe of a split object: the digests of its chunks, in order. Stored as
/// JSON in the large-object shard keyed by the digest of the whole object.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpliceManifest {
    pub chunks: Vec<Digest>,
}

impl LocalCas {
    ///
    /// Split a stored object into content-defined chunks. The chunks are stored as plain
    /// blobs and the manifest is recorded, so later `splice` calls can reassemble the object
    /// without it being resident.
    ///
    pub fn split(&self, digest: Digest, tree: bool) -> Result<SpliceManifest, String> {
        let payload = if tree {
            self.read_tree(digest)?
        } else {
            self.read_blob(digest)?
        }
        .ok_or_else(|| format!("Cannot split object not in CAS: {digest:?}"))?;

        let mut chunks = Vec::new();
        for (start, end) in chunk_boundaries(&payload) {
            chunks.push(self.store_bytes(&payload[start..end], false)?);
        }
        let manifest = SpliceManifest { chunks };

        let manifest_bytes = serde_json::to_vec(&manifest)
            .map_err(|e| format!("Failed to serialize splice manifest: {e}"))?;
        let shard = if tree {
            Shard::LargeTree
        } else {
            Shard::LargeFile
        };
        self.store_manifest(shard, digest, &manifest_bytes)?;
        Ok(manifest)
    }

    /// The recorded manifest of a previously split object, if any.
    pub fn load_manifest(&self, digest: Digest, tree: bool) -> Result<Option<SpliceManifest>, String> {
        let shard = if tree {
            Shard::LargeTree
        } else {
            Shard::LargeFile
        };
        let path = self.object_path_in(shard, digest);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| format!("Failed to read splice manifest for {digest:?}: {e}"))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| format!("Corrupt splice manifest for {digest:?}: {e}"))
    }

    ///
    /// Reassemble an object from its chunks and store it under its digest. The digest of the
    /// reassembled payload is verified against the expected one before anything is committed.
    ///
    pub fn splice(
        &self,
        expected: Digest,
        tree: bool,
        manifest: &SpliceManifest,
    ) -> Result<Digest, String> {
        let mut payload = Vec::new();
        for chunk in &manifest.chunks {
            let bytes = self
                .read_blob(*chunk)?
                .ok_or_else(|| format!("Splice chunk not in CAS: {chunk:?}"))?;
            payload.extend_from_slice(&bytes);
        }
        let actual = if tree {
            self.hash_function().hash_tree(&payload)
        } else {
            self.hash_function().hash_blob(&payload)
        };
        if actual != expected {
            return Err(format!(
                "Splice result does not match expected digest: expected {expected:?}, got {actual:?}"
            ));
        }
        if tree {
            self.store_tree_unvalidated(&payload)
        } else {
            self.store_bytes(&payload, false)
        }
    }

    fn store_manifest(&self, shard: Shard, digest: Digest, bytes: &[u8]) -> Result<(), String> {
        let target = self.object_path_in(shard, digest);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create shard subdir {parent:?}: {e}"))?;
        }
        if target.is_file() {
            return Ok(());
        }
        let temp = tempfile::NamedTempFile::new_in(
            target.parent().expect("manifest path has a parent"),
        )
        .map_err(|e| format!("Failed to stage splice manifest: {e}"))?;
        std::fs::write(temp.path(), bytes)
            .map_err(|e| format!("Failed to write splice manifest: {e}"))?;
        temp.persist(&target)
            .map(|_| ())
            .map_err(|e| format!("Failed to persist splice manifest: {e}"))
    }
}
