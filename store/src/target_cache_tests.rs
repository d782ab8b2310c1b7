// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use maplit::btreemap;

use fs::{ObjectInfo, ObjectType};
use hashing::HashFunction;

use crate::{LocalCas, LocalTargetCache, TargetCacheEntry, TargetCacheKey, WriteStrategy};

fn new_tc() -> (tempfile::TempDir, Arc<LocalCas>, Arc<LocalTargetCache>) {
    let dir = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(dir.path(), HashFunction::Compatible).unwrap());
    let tc = Arc::new(LocalTargetCache::open(dir.path(), cas.clone()).unwrap());
    (dir, cas, tc)
}

fn known(cas: &LocalCas, content: &[u8]) -> ObjectInfo {
    ObjectInfo::new(cas.store_bytes(content, false).unwrap(), ObjectType::File)
}

#[test]
fn key_is_content_addressed_and_explainable() {
    let (_dir, cas, _tc) = new_tc();
    let config = serde_json::json!({"ARCH": "x86_64"});
    let key = TargetCacheKey::create(&cas, "repo-fingerprint", "[\"@\",\"\",\"\",\"lib\"]", &config)
        .unwrap();
    let again =
        TargetCacheKey::create(&cas, "repo-fingerprint", "[\"@\",\"\",\"\",\"lib\"]", &config)
            .unwrap();
    assert_eq!(key, again);

    // The key description is itself a CAS blob.
    let blob = cas.read_blob(key.0).unwrap().unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    assert_eq!(parsed["repo_key"], "repo-fingerprint");

    let other_config = serde_json::json!({"ARCH": "arm64"});
    let other = TargetCacheKey::create(
        &cas,
        "repo-fingerprint",
        "[\"@\",\"\",\"\",\"lib\"]",
        &other_config,
    )
    .unwrap();
    assert_ne!(key, other);
}

#[test]
fn write_then_read_round_trips() {
    let (_dir, cas, tc) = new_tc();
    let key = TargetCacheKey::create(&cas, "repo", "target", &serde_json::json!({})).unwrap();
    let entry = TargetCacheEntry {
        artifacts: btreemap! {
            "out.txt".to_string() => known(&cas, b"artifact"),
        },
        runfiles: btreemap! {
            "run.sh".to_string() => known(&cas, b"runfile"),
        },
        provides: btreemap! {},
        implied_export_targets: ["[\"@\",\"dep\",\"\",\"exported\"]".to_string()]
            .into_iter()
            .collect(),
    };
    tc.write(key, &entry, WriteStrategy::Sync).unwrap();
    assert_eq!(tc.read(key).unwrap(), Some(entry));
}

#[test]
fn absent_key_is_a_miss() {
    let (_dir, cas, tc) = new_tc();
    let key = TargetCacheKey::create(&cas, "repo", "target", &serde_json::json!({})).unwrap();
    assert_eq!(tc.read(key).unwrap(), None);
}

#[test]
fn entries_referencing_unknown_objects_are_rejected() {
    let (_dir, cas, tc) = new_tc();
    let key = TargetCacheKey::create(&cas, "repo", "target", &serde_json::json!({})).unwrap();
    let entry = TargetCacheEntry {
        artifacts: btreemap! {
            "out".to_string() => ObjectInfo::new(
                HashFunction::Compatible.hash_blob(b"never stored"),
                ObjectType::File,
            ),
        },
        ..TargetCacheEntry::default()
    };
    tc.write(key, &entry, WriteStrategy::Sync)
        .expect_err("entries must be self-contained when written");
}

#[test]
fn disabled_strategy_writes_nothing() {
    let (_dir, cas, tc) = new_tc();
    let key = TargetCacheKey::create(&cas, "repo", "target", &serde_json::json!({})).unwrap();
    tc.write(key, &TargetCacheEntry::default(), WriteStrategy::Disabled)
        .unwrap();
    assert_eq!(tc.read(key).unwrap(), None);
}

#[test]
fn entry_json_uses_the_stable_field_names() {
    let entry = TargetCacheEntry {
        implied_export_targets: ["t".to_string()].into_iter().collect(),
        ..TargetCacheEntry::default()
    };
    let json = String::from_utf8(entry.to_json().unwrap()).unwrap();
    assert!(json.contains("\"implied export targets\""));
    assert!(json.contains("\"artifacts\""));
    assert!(json.contains("\"runfiles\""));
    assert!(json.contains("\"provides\""));
}
