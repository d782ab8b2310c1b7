// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use prost::Message;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use fs::directory::TreeChild;
use fs::tree_builder::{DirectoryTree, TreeEntry, TreeSink};
use fs::{directory, is_non_upwards_symlink_target, ObjectInfo, ObjectType};
use grpc_util::prost::MessageExt;
use hashing::{Digest, HashFunction};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use store::Storage;

use crate::{
    artifacts_from_result, ensure_outputs_present, Action, ExecutionApi, ExecutionApiError,
    ExecutionResponse,
};

/// Exit code recorded when an action is terminated for exceeding its timeout: the
/// termination signal with bit 128 set, as a shell would report it.
pub const TIMEOUT_EXIT_CODE: i32 = 128 + libc::SIGTERM;

/// Grace period between the termination signal and a hard kill.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeepSandboxes {
    Always,
    Never,
    OnFailure,
}

///
/// The local execution backend: stages each action's input root into a fresh working
/// directory under the build root (hard links where possible), runs the command as a child
/// process, and ingests declared outputs into the local CAS.
///
pub struct LocalApi {
    storage: Arc<Storage>,
    workdir_base: PathBuf,
    default_timeout: Duration,
    keep_sandboxes: KeepSandboxes,
}

impl LocalApi {
    pub fn new(
        storage: Arc<Storage>,
        workdir_base: PathBuf,
        default_timeout: Duration,
        keep_sandboxes: KeepSandboxes,
    ) -> Result<LocalApi, String> {
        std::fs::create_dir_all(&workdir_base)
            .map_err(|e| format!("Failed to create working directory base: {e}"))?;
        Ok(LocalApi {
            storage,
            workdir_base,
            default_timeout,
            keep_sandboxes,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    ///
    /// Materialize the input root into `dest` by hard-linking blobs out of the CAS, falling
    /// back to copies across filesystems. CAS objects are read-only, which actions are
    /// expected to honor for their inputs.
    ///
    fn stage_tree(&self, root: Digest, dest: &Path) -> Result<(), ExecutionApiError> {
        let cas = self.storage.cas();
        let payload = cas
            .read_tree(root)
            .map_err(ExecutionApiError::Unclassified)?
            .ok_or(ExecutionApiError::MissingDigest(root))?;
        std::fs::create_dir_all(dest)
            .map_err(|e| format!("Failed to create staging dir {dest:?}: {e}"))?;

        for child in directory::parse_tree_payload(self.hash_function(), &payload)? {
            match child {
                TreeChild::Object { name, info } => {
                    let target = dest.join(&name);
                    match info.object_type {
                        ObjectType::Tree => self.stage_tree(info.digest, &target)?,
                        ObjectType::Symlink => {
                            let link_target = cas
                                .read_blob(info.digest)
                                .map_err(ExecutionApiError::Unclassified)?
                                .ok_or(ExecutionApiError::MissingDigest(info.digest))?;
                            let link_target =
                                String::from_utf8(link_target.to_vec()).map_err(|e| {
                                    format!("Symlink target is not UTF-8: {e}")
                                })?;
                            std::os::unix::fs::symlink(&link_target, &target)
                                .map_err(|e| format!("Failed to stage symlink {name:?}: {e}"))?;
                        }
                        ObjectType::File | ObjectType::Executable => {
                            let source = cas
                                .blob_path(info.digest, info.object_type.is_executable())
                                .ok_or(ExecutionApiError::MissingDigest(info.digest))?;
                            if std::fs::hard_link(&source, &target).is_err() {
                                std::fs::copy(&source, &target).map_err(|e| {
                                    format!("Failed to stage input {name:?}: {e}")
                                })?;
                            }
                        }
                    }
                }
                TreeChild::Symlink { name, target } => {
                    std::os::unix::fs::symlink(&target, dest.join(&name))
                        .map_err(|e| format!("Failed to stage symlink {name:?}: {e}"))?;
                }
            }
        }
        Ok(())
    }

    async fn run_command(
        &self,
        action: &Action,
        workdir: &Path,
    ) -> Result<(i32, Bytes, Bytes), String> {
        // A dedicated, empty stdin: actions that read stdin see EOF, not the caller's tty.
        let stdin = tempfile::tempfile().map_err(|e| format!("Failed to create stdin: {e}"))?;

        let mut child = Command::new(&action.command[0])
            .args(&action.command[1..])
            .env_clear()
            .envs(&action.env)
            .current_dir(workdir)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("Failed to launch {:?}: {e}", action.command[0]))?;

        debug!("spawned local process as {:?} for {:?}", child.id(), action.command);

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_reader = tokio::spawn(async move {
            let mut buffer = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buffer).await;
            buffer
        });
        let stderr_reader = tokio::spawn(async move {
            let mut buffer = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buffer).await;
            buffer
        });

        let exit_code = match tokio::time::timeout(action.timeout, child.wait()).await {
            Ok(status) => {
                let status = status.map_err(|e| format!("Failed to wait for child: {e}"))?;
                status.code().unwrap_or_else(|| {
                    use std::os::unix::process::ExitStatusExt;
                    128 + status.signal().unwrap_or(0)
                })
            }
            Err(_) => {
                // The action ran into its timeout: terminate it and record the signal exit.
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
                if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait())
                    .await
                    .is_err()
                {
                    let _ = child.kill().await;
                }
                TIMEOUT_EXIT_CODE
            }
        };

        let stdout = stdout_reader
            .await
            .map_err(|e| format!("Failed to collect stdout: {e}"))?;
        let stderr = stderr_reader
            .await
            .map_err(|e| format!("Failed to collect stderr: {e}"))?;
        Ok((exit_code, Bytes::from(stdout), Bytes::from(stderr)))
    }

    ///
    /// Ingest the declared outputs of a finished action into the CAS and build the action
    /// result. Declared outputs that the action did not produce are simply absent; the
    /// caller decides whether that fails the action.
    ///
    fn collect_outputs(
        &self,
        action: &Action,
        workdir: &Path,
    ) -> Result<(remexec::ActionResult, BTreeMap<String, ObjectInfo>), String> {
        let cas = self.storage.cas();
        let mut result = remexec::ActionResult::default();
        let mut artifacts = BTreeMap::new();

        for path in &action.output_files {
            let on_disk = workdir.join(path);
            let Ok(metadata) = std::fs::symlink_metadata(&on_disk) else {
                continue;
            };
            let path_str = path.to_string();
            if metadata.file_type().is_symlink() {
                let target = std::fs::read_link(&on_disk)
                    .map_err(|e| format!("Failed to read output symlink {path}: {e}"))?;
                let target = target
                    .to_str()
                    .ok_or_else(|| format!("Output symlink target of {path} is not UTF-8"))?
                    .to_string();
                if !is_non_upwards_symlink_target(&target) {
                    return Err(format!(
                        "Output symlink {path} escapes the action directory: {target:?}"
                    ));
                }
                let digest = cas.store_bytes(target.as_bytes(), false)?;
                result.output_symlinks.push(remexec::OutputSymlink {
                    path: path_str.clone(),
                    target,
                });
                artifacts.insert(path_str, ObjectInfo::new(digest, ObjectType::Symlink));
            } else if metadata.is_file() {
                let executable = metadata.permissions().mode() & 0o100 != 0;
                let digest = cas.store_file(&on_disk, executable)?;
                result.output_files.push(remexec::OutputFile {
                    path: path_str.clone(),
                    digest: Some(digest.into()),
                    is_executable: executable,
                    ..remexec::OutputFile::default()
                });
                artifacts.insert(
                    path_str,
                    ObjectInfo::new(digest, ObjectType::from_exec_flag(executable)),
                );
            } else {
                return Err(format!("Declared output file {path} is a directory"));
            }
        }

        for path in &action.output_dirs {
            let on_disk = workdir.join(path);
            if !on_disk.is_dir() {
                continue;
            }
            let (root_digest, tree_digest) = self.ingest_directory(&on_disk)?;
            result.output_directories.push(remexec::OutputDirectory {
                path: path.to_string(),
                tree_digest: Some(tree_digest.into()),
                is_topologically_sorted: false,
            });
            artifacts.insert(
                path.to_string(),
                ObjectInfo::new(root_digest, ObjectType::Tree),
            );
        }

        Ok((result, artifacts))
    }

    ///
    /// Store a produced directory: the root directory digest addresses the tree in the CAS,
    /// and the returned tree digest is what the action result records (the root itself in
    /// native mode, the digest of a protocol `Tree` message in compatible mode).
    ///
    fn ingest_directory(&self, dir: &Path) -> Result<(Digest, Digest), String> {
        let tree = self.directory_tree_from_disk(dir)?;

        struct StoreSink<'a> {
            storage: &'a Storage,
            payloads: Vec<(Digest, Bytes)>,
        }
        impl TreeSink for StoreSink<'_> {
            fn store_blob(&mut self, _digest: Digest, bytes: Bytes) -> Result<(), String> {
                self.storage.cas().store_bytes(&bytes, false).map(|_| ())
            }
            fn store_tree(&mut self, digest: Digest, bytes: Bytes) -> Result<(), String> {
                self.storage.cas().store_tree(&bytes)?;
                self.payloads.push((digest, bytes));
                Ok(())
            }
        }

        let mut sink = StoreSink {
            storage: &self.storage,
            payloads: Vec::new(),
        };
        let root_digest = tree.write(self.hash_function(), &mut sink)?;

        match self.hash_function() {
            HashFunction::Native => Ok((root_digest, root_digest)),
            HashFunction::Compatible => {
                // Record a protocol Tree message so that action results interoperate with
                // other implementations of the protocol.
                let mut root = None;
                let mut children = Vec::new();
                let mut seen = std::collections::HashSet::new();
                for (digest, payload) in &sink.payloads {
                    if !seen.insert(*digest) {
                        continue;
                    }
                    let decoded = directory::decode_directory(*digest, payload)?;
                    if *digest == root_digest {
                        root = Some(decoded);
                    } else {
                        children.push(decoded);
                    }
                }
                let tree_message = remexec::Tree {
                    root,
                    children,
                };
                let tree_digest = self
                    .storage
                    .cas()
                    .store_bytes(&tree_message.to_bytes(), false)?;
                Ok((root_digest, tree_digest))
            }
        }
    }

    fn directory_tree_from_disk(&self, dir: &Path) -> Result<DirectoryTree, String> {
        let cas = self.storage.cas();
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(dir).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| format!("Failed to walk output dir {dir:?}: {e}"))?;
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| format!("Output path escaped its directory: {e}"))?;
            let relative = fs::RelativePath::new(relative)?;
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())
                    .map_err(|e| format!("Failed to read symlink {relative}: {e}"))?;
                let target = target
                    .to_str()
                    .ok_or_else(|| format!("Symlink target of {relative} is not UTF-8"))?
                    .to_string();
                if !is_non_upwards_symlink_target(&target) {
                    return Err(format!(
                        "Output symlink {relative} escapes the action directory: {target:?}"
                    ));
                }
                entries.push((relative, TreeEntry::Symlink { target }));
            } else if file_type.is_file() {
                let executable = entry
                    .metadata()
                    .map_err(|e| format!("Failed to stat {relative}: {e}"))?
                    .permissions()
                    .mode()
                    & 0o100
                    != 0;
                let digest = cas.store_file(entry.path(), executable)?;
                entries.push((relative, TreeEntry::Blob { digest, executable }));
            }
            // Plain directories appear implicitly through their children; empty ones are
            // added explicitly so they survive the round trip.
            else if file_type.is_dir()
                && std::fs::read_dir(entry.path())
                    .map(|mut dir| dir.next().is_none())
                    .unwrap_or(false)
            {
                let mut sink = fs::tree_builder::CollectingSink::default();
                let empty = DirectoryTree::new().write(self.hash_function(), &mut sink)?;
                for (_, payload) in sink.trees {
                    cas.store_tree(&payload)?;
                }
                entries.push((relative, TreeEntry::Tree { digest: empty }));
            }
        }
        DirectoryTree::from_entries(entries)
    }

    ///
    /// Resolve an action-cache hit into a response, verifying that every declared output is
    /// present both in the result and in the CAS. Any shortfall turns the hit into a miss.
    ///
    fn response_from_cache(
        &self,
        action: &Action,
        action_digest: Digest,
        result: &remexec::ActionResult,
    ) -> Result<ExecutionResponse, String> {
        ensure_outputs_present(result, &action.output_files, &action.output_dirs)?;
        let mut artifacts = artifacts_from_result(self.hash_function(), result)?;
        for dir in &result.output_directories {
            let tree_digest = protos::require_digest(dir.tree_digest.as_ref())?;
            let root_digest = self.resolve_output_tree(tree_digest)?;
            artifacts.insert(dir.path.clone(), ObjectInfo::new(root_digest, ObjectType::Tree));
        }
        for info in artifacts.values() {
            if !self.storage.cas().has(info) {
                return Err(format!("Cached output vanished from the CAS: {info}"));
            }
        }
        let stdout_digest = optional_digest(result.stdout_digest.as_ref(), self.hash_function())?;
        let stderr_digest = optional_digest(result.stderr_digest.as_ref(), self.hash_function())?;
        Ok(ExecutionResponse {
            action_digest,
            exit_code: result.exit_code,
            cached: true,
            artifacts,
            stdout_digest,
            stderr_digest,
        })
    }

    ///
    /// Like [`ExecutionApi::execute`], but also returns the protocol `ActionResult`, which
    /// the bundled execution service forwards to remote callers.
    ///
    pub async fn execute_full(
        &self,
        action: &Action,
        skip_cache_lookup: bool,
    ) -> Result<(ExecutionResponse, remexec::ActionResult), ExecutionApiError> {
        if action.command.is_empty() {
            return Err(ExecutionApiError::Unclassified(
                "Cannot execute an action with an empty command".to_string(),
            ));
        }
        let action_digest = action.digest(self.hash_function());

        if !skip_cache_lookup && !action.do_not_cache {
            if let Some(result) = self
                .storage
                .action_cache()
                .read(action_digest)
                .map_err(ExecutionApiError::Unclassified)?
            {
                match self.response_from_cache(action, action_digest, &result) {
                    Ok(response) => return Ok((response, result)),
                    Err(reason) => {
                        debug!("Treating cache hit for {action_digest:?} as a miss: {reason}");
                    }
                }
            }
        }

        let workdir = tempfile::Builder::new()
            .prefix("action-")
            .tempdir_in(&self.workdir_base)
            .map_err(|e| format!("Failed to create working directory: {e}"))?;
        self.stage_tree(action.input_root_digest, workdir.path())?;

        let (exit_code, stdout, stderr) = self.run_command(action, workdir.path()).await?;
        let (mut result, artifacts) = self.collect_outputs(action, workdir.path())?;

        let keep = self.keep_sandboxes == KeepSandboxes::Always
            || (self.keep_sandboxes == KeepSandboxes::OnFailure && exit_code != 0);
        if keep {
            let kept = workdir.keep();
            debug!("keeping action working directory at {kept:?}");
        }

        let cas = self.storage.cas();
        let stdout_digest = cas
            .store_bytes(&stdout, false)
            .map_err(ExecutionApiError::Unclassified)?;
        let stderr_digest = cas
            .store_bytes(&stderr, false)
            .map_err(ExecutionApiError::Unclassified)?;
        result.exit_code = exit_code;
        result.stdout_digest = Some(stdout_digest.into());
        result.stderr_digest = Some(stderr_digest.into());
        result.execution_metadata = Some(remexec::ExecutedActionMetadata {
            worker: "local".to_string(),
            ..remexec::ExecutedActionMetadata::default()
        });

        if exit_code == 0 {
            // A successful action must have produced everything it declared; a missing
            // output is an action failure even with a zero exit code.
            ensure_outputs_present(&result, &action.output_files, &action.output_dirs)?;
            if !action.do_not_cache {
                self.storage
                    .action_cache()
                    .write(action_digest, &result)
                    .map_err(ExecutionApiError::Unclassified)?;
            }
        }

        let response = ExecutionResponse {
            action_digest,
            exit_code,
            cached: false,
            artifacts,
            stdout_digest,
            stderr_digest,
        };
        Ok((response, result))
    }

    /// The root directory digest behind an action result's tree digest.
    fn resolve_output_tree(&self, tree_digest: Digest) -> Result<Digest, String> {
        match self.hash_function() {
            HashFunction::Native => Ok(tree_digest),
            HashFunction::Compatible => {
                let bytes = self
                    .storage
                    .cas()
                    .read_blob(tree_digest)?
                    .ok_or_else(|| format!("Tree message missing from CAS: {tree_digest:?}"))?;
                let tree = remexec::Tree::decode(&bytes[..])
                    .map_err(|e| format!("Corrupt Tree message {tree_digest:?}: {e}"))?;
                let root = tree
                    .root
                    .ok_or_else(|| format!("Tree message without root: {tree_digest:?}"))?;
                Ok(self.hash_function().hash_tree(&root.encode_to_vec()))
            }
        }
    }
}

fn optional_digest(
    digest: Option<&remexec::Digest>,
    hash_function: HashFunction,
) -> Result<Digest, String> {
    match digest {
        Some(digest) => digest.try_into(),
        None => Ok(hash_function.empty_blob_digest()),
    }
}

#[async_trait]
impl ExecutionApi for LocalApi {
    fn hash_function(&self) -> HashFunction {
        self.storage.hash_function()
    }

    fn default_action_timeout(&self) -> Duration {
        self.default_timeout
    }

    async fn execute(
        &self,
        action: &Action,
        skip_cache_lookup: bool,
    ) -> Result<ExecutionResponse, ExecutionApiError> {
        self.execute_full(action, skip_cache_lookup)
            .await
            .map(|(response, _)| response)
    }

    async fn upload(
        &self,
        blobs: Vec<(Digest, Bytes)>,
        _skip_find_missing: bool,
    ) -> Result<(), String> {
        let cas = self.storage.cas();
        for (digest, bytes) in blobs {
            cas.store_verified(digest, &bytes)?;
        }
        Ok(())
    }

    async fn is_available(&self, infos: &[ObjectInfo]) -> Result<Vec<ObjectInfo>, String> {
        Ok(self.storage.cas().missing(infos))
    }

    async fn read_object(&self, info: &ObjectInfo) -> Result<Option<Bytes>, String> {
        self.storage.cas().read_object(info)
    }
}
