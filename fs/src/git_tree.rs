// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The canonical git tree payload: a sequence of `<mode> <name>\0<raw id>` entries, sorted by
//! name with tree entries compared as if their name had a trailing slash.

use hashing::{Fingerprint, SHA1_FINGERPRINT_SIZE};

use crate::ObjectType;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GitTreeEntry {
    pub name: String,
    pub object_type: ObjectType,
    pub id: Fingerprint,
}

impl GitTreeEntry {
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.object_type.is_tree() {
            key.push(b'/');
        }
        key
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Empty name in tree entry".to_string());
    }
    if name == "." || name == ".." {
        return Err(format!("Invalid name in tree entry: {name:?}"));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(format!("Invalid character in tree entry name: {name:?}"));
    }
    Ok(())
}

///
/// Serialize entries into a canonical git tree payload. Entries are sorted here; callers need
/// not pre-sort. Duplicate names are rejected.
///
pub fn encode(mut entries: Vec<GitTreeEntry>) -> Result<Vec<u8>, String> {
    for entry in &entries {
        validate_name(&entry.name)?;
        if entry.id.len() != SHA1_FINGERPRINT_SIZE {
            return Err(format!(
                "Git tree entry {:?} has a non-git object id: {}",
                entry.name, entry.id
            ));
        }
    }
    entries.sort_by(|l, r| l.sort_key().cmp(&r.sort_key()));
    for window in entries.windows(2) {
        if window[0].name == window[1].name {
            return Err(format!("Duplicate name in tree: {:?}", window[0].name));
        }
    }

    let mut payload = Vec::new();
    for entry in &entries {
        payload.extend_from_slice(entry.object_type.git_mode().as_bytes());
        payload.push(b' ');
        payload.extend_from_slice(entry.name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(entry.id.as_bytes());
    }
    Ok(payload)
}

///
/// Parse a git tree payload back into its entries. The payload must be canonical: parse errors
/// are protocol errors, not recoverable conditions.
///
pub fn parse(payload: &[u8]) -> Result<Vec<GitTreeEntry>, String> {
    let mut entries = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or("Malformed git tree: missing mode terminator")?;
        let mode = std::str::from_utf8(&rest[..space])
            .map_err(|e| format!("Malformed git tree mode: {e}"))?;
        let object_type = ObjectType::from_git_mode(mode)?;
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or("Malformed git tree: missing name terminator")?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|e| format!("Malformed git tree name: {e}"))?
            .to_string();
        validate_name(&name)?;
        rest = &rest[nul + 1..];

        if rest.len() < SHA1_FINGERPRINT_SIZE {
            return Err("Malformed git tree: truncated object id".to_string());
        }
        let id = Fingerprint::from_bytes(&rest[..SHA1_FINGERPRINT_SIZE])?;
        rest = &rest[SHA1_FINGERPRINT_SIZE..];

        entries.push(GitTreeEntry {
            name,
            object_type,
            id,
        });
    }

    // Reject non-canonical ordering rather than silently repairing it: a digest computed over
    // a reordered payload would no longer match the tree it claims to be.
    for window in entries.windows(2) {
        if window[0].sort_key() >= window[1].sort_key() {
            return Err(format!(
                "Git tree entries not in canonical order: {:?} before {:?}",
                window[0].name, window[1].name
            ));
        }
    }
    Ok(entries)
}
