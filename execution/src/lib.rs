// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Execution API: one contract for running actions and moving their artifacts, with a
//! local subprocess backend and a remote-execution backend. The scheduler drives whichever
//! backend the invocation configured, through this interface only.

pub mod action;
pub mod local;
pub mod remote;

#[cfg(test)]
mod local_tests;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use fs::directory::TreeChild;
use fs::{directory, ObjectInfo, ObjectType, RelativePath};
use hashing::{Digest, HashFunction};
use protos::gen::build::bazel::remote::execution::v2 as remexec;

pub use crate::action::Action;

///
/// How an execution attempt failed. An action that ran and exited non-zero is NOT an error;
/// it comes back as a normal `ExecutionResponse`.
///
#[derive(Debug)]
pub enum ExecutionApiError {
    /// The action exceeded its deadline.
    Timeout,
    /// The backend rejected the action's preconditions (typically missing inputs).
    Precondition(String),
    /// An input was not present in any reachable CAS.
    MissingDigest(Digest),
    Unclassified(String),
}

impl fmt::Display for ExecutionApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionApiError::Timeout => write!(f, "action exceeded its timeout"),
            ExecutionApiError::Precondition(msg) => write!(f, "precondition failed: {msg}"),
            ExecutionApiError::MissingDigest(digest) => {
                write!(f, "digest missing from every available CAS: {digest:?}")
            }
            ExecutionApiError::Unclassified(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<String> for ExecutionApiError {
    fn from(msg: String) -> Self {
        ExecutionApiError::Unclassified(msg)
    }
}

///
/// The result of executing (or cache-resolving) one action.
///
#[derive(Clone, Debug)]
pub struct ExecutionResponse {
    pub action_digest: Digest,
    pub exit_code: i32,
    /// Whether the result was served from an action cache rather than executed.
    pub cached: bool,
    /// Declared outputs by root-relative path, in sorted path order.
    pub artifacts: BTreeMap<String, ObjectInfo>,
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
}

///
/// The uniform execution contract: upload blobs, check availability, run an action, and move
/// results between backends. Implementations exist for the local subprocess executor and for
/// remote execution endpoints.
///
#[async_trait]
pub trait ExecutionApi: Send + Sync {
    fn hash_function(&self) -> HashFunction;

    /// Applied when an action does not set its own timeout.
    fn default_action_timeout(&self) -> Duration;

    fn create_action(
        &self,
        input_root_digest: Digest,
        command: Vec<String>,
        output_files: Vec<RelativePath>,
        output_dirs: Vec<RelativePath>,
        env: BTreeMap<String, String>,
        platform_properties: BTreeMap<String, String>,
        timeout: Option<Duration>,
        do_not_cache: bool,
    ) -> Action {
        Action::new(
            input_root_digest,
            command,
            output_files,
            output_dirs,
            env,
            platform_properties,
            timeout.unwrap_or_else(|| self.default_action_timeout()),
            do_not_cache,
        )
    }

    /// Run an action, consulting the action caches unless told not to.
    async fn execute(
        &self,
        action: &Action,
        skip_cache_lookup: bool,
    ) -> Result<ExecutionResponse, ExecutionApiError>;

    /// Make blobs available in this backend's CAS. With `skip_find_missing`, the caller has
    /// already determined that every blob is missing.
    async fn upload(
        &self,
        blobs: Vec<(Digest, Bytes)>,
        skip_find_missing: bool,
    ) -> Result<(), String>;

    /// The subset of `infos` this backend does not have.
    async fn is_available(&self, infos: &[ObjectInfo]) -> Result<Vec<ObjectInfo>, String>;

    /// The bytes of one object, or None when this backend does not have it.
    async fn read_object(&self, info: &ObjectInfo) -> Result<Option<Bytes>, String>;

    async fn retrieve_to_memory(&self, info: &ObjectInfo) -> Result<Bytes, String> {
        self.read_object(info)
            .await?
            .ok_or_else(|| format!("Object not available: {info}"))
    }

    /// Materialize objects at filesystem paths, trees recursively.
    async fn retrieve_to_paths(
        &self,
        infos: &[ObjectInfo],
        paths: &[PathBuf],
    ) -> Result<(), String> {
        if infos.len() != paths.len() {
            return Err(format!(
                "retrieve_to_paths: {} objects but {} paths",
                infos.len(),
                paths.len()
            ));
        }
        for (info, path) in infos.iter().zip(paths.iter()) {
            materialize_object(self, info, path).await?;
        }
        Ok(())
    }

    /// Dump objects to raw file descriptors, e.g. stdout and stderr. Trees are rendered as
    /// entry listings unless `raw_tree` asks for the canonical payload.
    async fn retrieve_to_fds(
        &self,
        infos: &[ObjectInfo],
        fds: &[RawFd],
        raw_tree: bool,
    ) -> Result<(), String> {
        if infos.len() != fds.len() {
            return Err(format!(
                "retrieve_to_fds: {} objects but {} fds",
                infos.len(),
                fds.len()
            ));
        }
        for (info, fd) in infos.iter().zip(fds.iter()) {
            let bytes = self.retrieve_to_memory(info).await?;
            let rendered = if info.object_type.is_tree() && !raw_tree {
                render_tree_listing(self.hash_function(), &bytes)?
            } else {
                bytes
            };
            write_to_fd(*fd, &rendered)?;
        }
        Ok(())
    }

    ///
    /// The cross-backend bridge: walk the given objects (trees recursively), determine the
    /// minimal missing set at `other`, read those objects here and upload them there. The
    /// upload skips its own find-missing pass, because the missing set is already known.
    ///
    async fn retrieve_to_cas(
        &self,
        infos: &[ObjectInfo],
        other: &dyn ExecutionApi,
    ) -> Result<(), String> {
        let closure = object_closure(self, infos).await?;
        let missing: HashSet<ObjectInfo> = other
            .is_available(&closure)
            .await?
            .into_iter()
            .collect();

        // Children were appended after their parents; uploading in reverse order means a
        // reader of the destination never sees a tree whose children are absent.
        let mut blobs = Vec::new();
        for info in closure.iter().rev() {
            if !missing.contains(info) {
                continue;
            }
            let bytes = self
                .read_object(info)
                .await?
                .ok_or_else(|| format!("Object vanished during transfer: {info}"))?;
            blobs.push((info.digest, bytes));
        }
        other.upload(blobs, true).await
    }
}

///
/// The dependency closure of `infos`: every object reachable through tree children, parents
/// before children, deduplicated. Symlinks inlined in compatible-mode directories carry no
/// objects of their own and do not appear.
///
pub async fn object_closure<A: ExecutionApi + ?Sized>(
    api: &A,
    infos: &[ObjectInfo],
) -> Result<Vec<ObjectInfo>, String> {
    let mut closure = Vec::new();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<ObjectInfo> = infos.iter().copied().collect();
    while let Some(info) = queue.pop_front() {
        if !seen.insert(info.digest.hash) {
            continue;
        }
        closure.push(info);
        if info.object_type.is_tree() {
            let payload = api
                .read_object(&info)
                .await?
                .ok_or_else(|| format!("Tree not available while walking: {info}"))?;
            for child in directory::parse_tree_payload(api.hash_function(), &payload)? {
                if let TreeChild::Object { info, .. } = child {
                    queue.push_back(info);
                }
            }
        }
    }
    Ok(closure)
}

///
/// Materialize one object at `dest`: files with their executable bit, symlinks as symlinks,
/// trees recursively.
///
pub fn materialize_object<'a, A: ExecutionApi + ?Sized>(
    api: &'a A,
    info: &'a ObjectInfo,
    dest: &'a Path,
) -> BoxFuture<'a, Result<(), String>> {
    async move {
        match info.object_type {
            ObjectType::File | ObjectType::Executable => {
                let bytes = api.retrieve_to_memory(info).await?;
                write_file(dest, &bytes, info.object_type.is_executable())
            }
            ObjectType::Symlink => {
                let target = api.retrieve_to_memory(info).await?;
                let target = String::from_utf8(target.to_vec())
                    .map_err(|e| format!("Symlink target is not UTF-8: {e}"))?;
                make_symlink(dest, &target)
            }
            ObjectType::Tree => {
                let payload = api.retrieve_to_memory(info).await?;
                std::fs::create_dir_all(dest)
                    .map_err(|e| format!("Failed to create directory {dest:?}: {e}"))?;
                for child in directory::parse_tree_payload(api.hash_function(), &payload)? {
                    match child {
                        TreeChild::Object { name, info } => {
                            materialize_object(api, &info, &dest.join(name)).await?;
                        }
                        TreeChild::Symlink { name, target } => {
                            make_symlink(&dest.join(name), &target)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
    .boxed()
}

fn write_file(dest: &Path, bytes: &[u8], executable: bool) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create parent of {dest:?}: {e}"))?;
    }
    std::fs::write(dest, bytes).map_err(|e| format!("Failed to write {dest:?}: {e}"))?;
    let mode = if executable { 0o755 } else { 0o644 };
    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))
        .map_err(|e| format!("Failed to set permissions on {dest:?}: {e}"))
}

fn make_symlink(dest: &Path, target: &str) -> Result<(), String> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create parent of {dest:?}: {e}"))?;
    }
    if std::fs::symlink_metadata(dest).is_ok() {
        std::fs::remove_file(dest)
            .map_err(|e| format!("Failed to replace symlink {dest:?}: {e}"))?;
    }
    std::os::unix::fs::symlink(target, dest)
        .map_err(|e| format!("Failed to create symlink {dest:?} -> {target:?}: {e}"))
}

fn write_to_fd(fd: RawFd, bytes: &[u8]) -> Result<(), String> {
    // Duplicate the descriptor so that dropping the File does not close the caller's fd.
    let duped = unsafe { libc::dup(fd) };
    if duped < 0 {
        return Err(format!(
            "Failed to duplicate fd {fd}: {}",
            std::io::Error::last_os_error()
        ));
    }
    let mut file = unsafe { <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(duped) };
    file.write_all(bytes)
        .map_err(|e| format!("Failed to write to fd {fd}: {e}"))
}

fn render_tree_listing(hash_function: HashFunction, payload: &[u8]) -> Result<Bytes, String> {
    let mut out = String::new();
    for child in directory::parse_tree_payload(hash_function, payload)? {
        match child {
            TreeChild::Object { name, info } => {
                out.push_str(&format!("{info} {name}\n"));
            }
            TreeChild::Symlink { name, target } => {
                out.push_str(&format!("[symlink] {name} -> {target}\n"));
            }
        }
    }
    Ok(Bytes::from(out))
}

///
/// Verify that every declared output appears in an action result. A result that passed the
/// cache but lost an output is treated as a miss by the scheduler.
///
pub fn ensure_outputs_present(
    result: &remexec::ActionResult,
    output_files: &[RelativePath],
    output_dirs: &[RelativePath],
) -> Result<(), String> {
    let files: HashSet<&str> = result
        .output_files
        .iter()
        .map(|f| f.path.as_str())
        .chain(result.output_symlinks.iter().map(|s| s.path.as_str()))
        .chain(result.output_file_symlinks.iter().map(|s| s.path.as_str()))
        .collect();
    let dirs: HashSet<&str> = result
        .output_directories
        .iter()
        .map(|d| d.path.as_str())
        .chain(result.output_symlinks.iter().map(|s| s.path.as_str()))
        .chain(
            result
                .output_directory_symlinks
                .iter()
                .map(|s| s.path.as_str()),
        )
        .collect();

    for path in output_files {
        let path = path.to_str().unwrap_or_default();
        if !files.contains(path) {
            return Err(format!("Action result is missing declared output file {path:?}"));
        }
    }
    for path in output_dirs {
        let path = path.to_str().unwrap_or_default();
        if !dirs.contains(path) {
            return Err(format!(
                "Action result is missing declared output directory {path:?}"
            ));
        }
    }
    Ok(())
}

///
/// The file and symlink portion of an action result as an artifacts map. Directory outputs
/// are backend-specific (tree digests resolve differently) and are added by the caller.
///
pub(crate) fn artifacts_from_result(
    hash_function: HashFunction,
    result: &remexec::ActionResult,
) -> Result<BTreeMap<String, ObjectInfo>, String> {
    let mut artifacts = BTreeMap::new();
    for file in &result.output_files {
        let digest = protos::require_digest(file.digest.as_ref())?;
        artifacts.insert(
            file.path.clone(),
            ObjectInfo::new(digest, ObjectType::from_exec_flag(file.is_executable)),
        );
    }
    for symlink in result
        .output_symlinks
        .iter()
        .chain(&result.output_file_symlinks)
        .chain(&result.output_directory_symlinks)
    {
        let digest = hash_function.hash_blob(symlink.target.as_bytes());
        artifacts.insert(
            symlink.path.clone(),
            ObjectInfo::new(digest, ObjectType::Symlink),
        );
    }
    Ok(artifacts)
}
