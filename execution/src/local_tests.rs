// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use maplit::btreemap;

use fs::tree_builder::{CollectingSink, DirectoryTree, TreeEntry};
use fs::{ObjectInfo, ObjectType, RelativePath};
use hashing::{Digest, HashFunction};
use store::Storage;

use crate::local::{KeepSandboxes, LocalApi, TIMEOUT_EXIT_CODE};
use crate::{ExecutionApi, ExecutionApiError};

fn new_api(hash_function: HashFunction) -> (tempfile::TempDir, LocalApi) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::open(dir.path(), hash_function).unwrap());
    let api = LocalApi::new(
        storage,
        dir.path().join("work"),
        Duration::from_secs(60),
        KeepSandboxes::Never,
    )
    .unwrap();
    (dir, api)
}

/// Stage a set of blobs into the local CAS and return the root tree digest.
fn input_root(api: &LocalApi, entries: Vec<(&str, &[u8])>) -> Digest {
    let hash_function = api.hash_function();
    let cas = api.storage().cas();
    let tree_entries = entries
        .into_iter()
        .map(|(path, content)| {
            let digest = cas.store_bytes(content, false).unwrap();
            (
                RelativePath::new(path).unwrap(),
                TreeEntry::Blob {
                    digest,
                    executable: false,
                },
            )
        })
        .collect::<Vec<_>>();
    let tree = DirectoryTree::from_entries(tree_entries).unwrap();
    let mut sink = CollectingSink::default();
    let root = tree.write(hash_function, &mut sink).unwrap();
    for (_, payload) in sink.trees {
        cas.store_tree(&payload).unwrap();
    }
    for (_, payload) in sink.blobs {
        cas.store_bytes(&payload, false).unwrap();
    }
    root
}

fn shell_action(api: &LocalApi, script: &str, output_files: Vec<&str>) -> crate::Action {
    shell_action_with_env(api, script, output_files, BTreeMap::new())
}

fn shell_action_with_env(
    api: &LocalApi,
    script: &str,
    output_files: Vec<&str>,
    env: BTreeMap<String, String>,
) -> crate::Action {
    api.create_action(
        api.hash_function().empty_tree_digest(),
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        output_files
            .into_iter()
            .map(|p| RelativePath::new(p).unwrap())
            .collect(),
        vec![],
        env,
        BTreeMap::new(),
        None,
        false,
    )
}

#[tokio::test]
async fn captures_stdout_and_exit_code() {
    for hash_function in [HashFunction::Native, HashFunction::Compatible] {
        let (_dir, api) = new_api(hash_function);
        // The empty input root must exist before staging.
        input_root(&api, vec![]);

        let action = shell_action(&api, "echo Hello, World!", vec![]);
        let response = api.execute(&action, false).await.unwrap();
        assert_eq!(response.exit_code, 0);
        assert!(!response.cached);

        let stdout = api
            .retrieve_to_memory(&ObjectInfo::new(response.stdout_digest, ObjectType::File))
            .await
            .unwrap();
        assert_eq!(&stdout[..], b"Hello, World!\n");
    }
}

#[tokio::test]
async fn env_is_propagated_verbatim() {
    let (_dir, api) = new_api(HashFunction::Compatible);
    input_root(&api, vec![]);

    let action = shell_action_with_env(
        &api,
        "echo -n \"${MYTESTVAR}\"",
        vec![],
        btreemap! { "MYTESTVAR".to_string() => "contents of env variable".to_string() },
    );
    let response = api.execute(&action, false).await.unwrap();
    assert_eq!(response.exit_code, 0);
    assert_eq!(
        response.stdout_digest,
        HashFunction::Compatible.hash_blob(b"contents of env variable")
    );
}

#[tokio::test]
async fn declared_outputs_are_ingested() {
    let (_dir, api) = new_api(HashFunction::Native);
    input_root(&api, vec![]);

    let action = shell_action(&api, "echo Hello, World! > out.txt", vec!["out.txt"]);
    let response = api.execute(&action, false).await.unwrap();
    assert_eq!(response.exit_code, 0);

    let info = response.artifacts.get("out.txt").unwrap();
    assert_eq!(info.object_type, ObjectType::File);
    let content = api.retrieve_to_memory(info).await.unwrap();
    assert_eq!(&content[..], b"Hello, World!\n");
}

#[tokio::test]
async fn inputs_are_staged_at_their_paths() {
    let (_dir, api) = new_api(HashFunction::Native);
    let root = input_root(&api, vec![("sub/input.txt", b"staged content")]);

    let action = api.create_action(
        root,
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "/bin/cp sub/input.txt copied.txt".to_string(),
        ],
        vec![RelativePath::new("copied.txt").unwrap()],
        vec![],
        BTreeMap::new(),
        BTreeMap::new(),
        None,
        false,
    );
    let response = api.execute(&action, false).await.unwrap();
    assert_eq!(response.exit_code, 0);

    let info = response.artifacts.get("copied.txt").unwrap();
    let content = api.retrieve_to_memory(info).await.unwrap();
    assert_eq!(&content[..], b"staged content");
}

#[tokio::test]
async fn execution_is_cached_by_action_digest() {
    let (_dir, api) = new_api(HashFunction::Compatible);
    input_root(&api, vec![]);

    // The output embeds a nanosecond timestamp: a re-execution would change it.
    let action = shell_action(&api, "/bin/date +%s%N > stamp.txt", vec!["stamp.txt"]);

    let first = api.execute(&action, false).await.unwrap();
    assert!(!first.cached);
    let second = api.execute(&action, false).await.unwrap();
    assert!(second.cached);
    assert_eq!(first.artifacts, second.artifacts);
}

#[tokio::test]
async fn skip_cache_lookup_forces_re_execution() {
    let (_dir, api) = new_api(HashFunction::Compatible);
    input_root(&api, vec![]);

    let action = shell_action(&api, "/bin/date +%s%N > stamp.txt", vec!["stamp.txt"]);
    let first = api.execute(&action, false).await.unwrap();
    let second = api.execute(&action, true).await.unwrap();
    assert!(!second.cached);
    // A flaky action: the two runs disagree.
    assert_ne!(first.artifacts, second.artifacts);
}

#[tokio::test]
async fn do_not_cache_suppresses_the_action_cache() {
    let (_dir, api) = new_api(HashFunction::Compatible);
    input_root(&api, vec![]);

    let mut action = shell_action(&api, "echo cached > out.txt", vec!["out.txt"]);
    action.do_not_cache = true;

    let digest = action.digest(api.hash_function());
    api.execute(&action, false).await.unwrap();
    assert!(!api.storage().action_cache().has(digest));

    let second = api.execute(&action, false).await.unwrap();
    assert!(!second.cached);
}

#[tokio::test]
async fn failed_actions_report_their_exit_code() {
    let (_dir, api) = new_api(HashFunction::Native);
    input_root(&api, vec![]);

    let action = shell_action(&api, "echo oops >&2; exit 17", vec![]);
    let response = api.execute(&action, false).await.unwrap();
    assert_eq!(response.exit_code, 17);

    let stderr = api
        .retrieve_to_memory(&ObjectInfo::new(response.stderr_digest, ObjectType::File))
        .await
        .unwrap();
    assert_eq!(&stderr[..], b"oops\n");
    // Failures are not cached.
    assert!(!api.storage().action_cache().has(action.digest(api.hash_function())));
}

#[tokio::test]
async fn missing_declared_output_fails_the_action() {
    let (_dir, api) = new_api(HashFunction::Native);
    input_root(&api, vec![]);

    let action = shell_action(&api, "true", vec!["never-written.txt"]);
    match api.execute(&action, false).await {
        Err(ExecutionApiError::Unclassified(msg)) => {
            assert!(msg.contains("never-written.txt"), "unexpected message: {msg}")
        }
        other => panic!("expected a missing-output failure, got {other:?}"),
    }
}

#[tokio::test]
async fn timeouts_are_encoded_in_the_exit_code() {
    let (_dir, api) = new_api(HashFunction::Native);
    input_root(&api, vec![]);

    let mut action = shell_action(&api, "/bin/sleep 30", vec![]);
    action.timeout = Duration::from_millis(200);

    let response = api.execute(&action, false).await.unwrap();
    assert_eq!(response.exit_code, TIMEOUT_EXIT_CODE);
}

#[tokio::test]
async fn output_directories_round_trip() {
    let (dir, api) = new_api(HashFunction::Compatible);
    input_root(&api, vec![]);

    let action = api.create_action(
        api.hash_function().empty_tree_digest(),
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "/bin/mkdir -p result/sub && echo alpha > result/a.txt && echo beta > result/sub/b.txt"
                .to_string(),
        ],
        vec![],
        vec![RelativePath::new("result").unwrap()],
        BTreeMap::new(),
        BTreeMap::new(),
        None,
        false,
    );
    let response = api.execute(&action, false).await.unwrap();
    assert_eq!(response.exit_code, 0);

    let info = response.artifacts.get("result").unwrap();
    assert_eq!(info.object_type, ObjectType::Tree);

    let dest = dir.path().join("materialized");
    api.retrieve_to_paths(&[*info], &[dest.clone()]).await.unwrap();
    assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"alpha\n");
    assert_eq!(std::fs::read(dest.join("sub/b.txt")).unwrap(), b"beta\n");
}

#[tokio::test]
async fn upload_round_trips_blobs_and_trees() {
    let (_dir, api) = new_api(HashFunction::Native);
    let hash_function = api.hash_function();

    let blob_digest = hash_function.hash_blob(b"uploaded blob");
    api.upload(vec![(blob_digest, bytes::Bytes::from_static(b"uploaded blob"))], true)
        .await
        .unwrap();

    let info = ObjectInfo::new(blob_digest, ObjectType::File);
    assert_eq!(api.is_available(&[info]).await.unwrap(), vec![]);
    assert_eq!(
        api.retrieve_to_memory(&info).await.unwrap(),
        bytes::Bytes::from_static(b"uploaded blob")
    );

    let absent = ObjectInfo::new(hash_function.hash_blob(b"absent"), ObjectType::File);
    assert_eq!(api.is_available(&[absent]).await.unwrap(), vec![absent]);

    api.upload(
        vec![(hash_function.hash_blob(b"wrong"), bytes::Bytes::from_static(b"payload"))],
        true,
    )
    .await
    .expect_err("mismatched digests must be rejected");
}
