// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use prost::Message;

use fs::{ObjectInfo, ObjectType};
use hashing::{Digest, HashFunction};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use remote::action_cache::RemoteActionCache;
use remote::byte_store::ByteStore;
use remote::execution_client::{ExecutionClient, ExecutionError};
use remote::RemoteOptions;
use store::Storage;

use crate::{
    artifacts_from_result, ensure_outputs_present, object_closure, Action, ExecutionApi,
    ExecutionApiError, ExecutionResponse,
};

///
/// The remote execution backend: uploads whatever inputs the endpoint is missing, submits the
/// action digest for execution, and resolves the returned result against the remote CAS.
/// Outputs stay remote until something retrieves them.
///
pub struct RemoteApi {
    storage: Arc<Storage>,
    byte_store: ByteStore,
    action_cache: RemoteActionCache,
    execution: ExecutionClient,
    default_timeout: Duration,
    invocation_id: String,
}

impl RemoteApi {
    pub fn new(
        storage: Arc<Storage>,
        options: &RemoteOptions,
        default_timeout: Duration,
        invocation_id: String,
    ) -> Result<RemoteApi, String> {
        let byte_store = ByteStore::new(options, storage.hash_function())?;
        let action_cache = RemoteActionCache::new(options)?;
        let execution = ExecutionClient::new(options)?;
        Ok(RemoteApi {
            storage,
            byte_store,
            action_cache,
            execution,
            default_timeout,
            invocation_id,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    ///
    /// Upload whatever the endpoint is missing for this action: the closure of the input
    /// root, the serialized action, and (in compatible mode) the command message. Only
    /// objects the endpoint reports missing are read locally, so inputs produced by earlier
    /// remote actions never have to exist on this machine.
    ///
    async fn upload_missing_inputs(&self, action: &Action) -> Result<(), ExecutionApiError> {
        let hash_function = self.hash_function();
        let root_info = ObjectInfo::new(action.input_root_digest, ObjectType::Tree);
        let closure = object_closure(self, &[root_info])
            .await
            .map_err(ExecutionApiError::Unclassified)?;

        let serialized_action = action.serialized(hash_function);
        let action_digest = action.digest(hash_function);
        let command_blob = match hash_function {
            HashFunction::Native => None,
            HashFunction::Compatible => {
                let (_, command) = action.to_protos(hash_function);
                let command_bytes = Bytes::from(command.encode_to_vec());
                Some((hash_function.hash_data(&command_bytes), command_bytes))
            }
        };

        let all_digests: Vec<Digest> = closure
            .iter()
            .map(|info| info.digest)
            .chain([action_digest])
            .chain(command_blob.iter().map(|(digest, _)| *digest))
            .collect();
        let missing: HashSet<Digest> = self.byte_store.find_missing_digests(all_digests).await?;

        // Children were appended after their parents; upload them first so the endpoint
        // never sees a tree whose children are absent.
        let cas = self.storage.cas();
        let mut blobs: Vec<(Digest, Bytes)> = Vec::new();
        for info in closure.iter().rev() {
            if !missing.contains(&info.digest) {
                continue;
            }
            let bytes = cas
                .read_object(info)
                .map_err(ExecutionApiError::Unclassified)?
                .ok_or(ExecutionApiError::MissingDigest(info.digest))?;
            blobs.push((info.digest, bytes));
        }
        if missing.contains(&action_digest) {
            blobs.push((action_digest, serialized_action));
        }
        if let Some((digest, bytes)) = command_blob {
            if missing.contains(&digest) {
                blobs.push((digest, bytes));
            }
        }

        self.byte_store
            .store_blobs(blobs, true)
            .await
            .map_err(ExecutionApiError::Unclassified)
    }

    ///
    /// Turn a remote action result into a response: verify the declared outputs, resolve
    /// directory outputs to their root digests (ingesting compatible-mode `Tree` messages
    /// into local storage), and record symlink targets locally so they can be materialized.
    ///
    async fn response_from_result(
        &self,
        action: &Action,
        action_digest: Digest,
        result: &remexec::ActionResult,
        cached: bool,
    ) -> Result<ExecutionResponse, String> {
        ensure_outputs_present(result, &action.output_files, &action.output_dirs)?;
        let hash_function = self.hash_function();
        let mut artifacts = artifacts_from_result(hash_function, result)?;

        for symlink in result
            .output_symlinks
            .iter()
            .chain(&result.output_file_symlinks)
            .chain(&result.output_directory_symlinks)
        {
            self.storage
                .cas()
                .store_bytes(symlink.target.as_bytes(), false)?;
        }

        for dir in &result.output_directories {
            let tree_digest = protos::require_digest(dir.tree_digest.as_ref())?;
            let root_digest = self.resolve_output_tree(tree_digest).await?;
            artifacts.insert(dir.path.clone(), ObjectInfo::new(root_digest, ObjectType::Tree));
        }

        let stdout_digest = match result.stdout_digest.as_ref() {
            Some(digest) => digest.try_into()?,
            None => hash_function.empty_blob_digest(),
        };
        let stderr_digest = match result.stderr_digest.as_ref() {
            Some(digest) => digest.try_into()?,
            None => hash_function.empty_blob_digest(),
        };

        Ok(ExecutionResponse {
            action_digest,
            exit_code: result.exit_code,
            cached,
            artifacts,
            stdout_digest,
            stderr_digest,
        })
    }

    ///
    /// Resolve a locally cached result, but only if the remote endpoint still has every
    /// object it references; otherwise report None so the remote cache (or execution)
    /// takes over.
    ///
    async fn try_local_hit(
        &self,
        action: &Action,
        action_digest: Digest,
        result: &remexec::ActionResult,
    ) -> Result<Option<ExecutionResponse>, String> {
        let response = self
            .response_from_result(action, action_digest, result, true)
            .await?;
        let referenced: Vec<Digest> = response
            .artifacts
            .values()
            .map(|info| info.digest)
            .chain([response.stdout_digest, response.stderr_digest])
            .collect();
        let missing = self.byte_store.find_missing_digests(referenced).await?;
        if missing.is_empty() {
            Ok(Some(response))
        } else {
            Ok(None)
        }
    }

    async fn resolve_output_tree(&self, tree_digest: Digest) -> Result<Digest, String> {
        match self.hash_function() {
            HashFunction::Native => Ok(tree_digest),
            HashFunction::Compatible => {
                let info = ObjectInfo::new(tree_digest, ObjectType::File);
                let bytes = self
                    .byte_store
                    .load_object(&info)
                    .await?
                    .ok_or_else(|| format!("Tree message missing remotely: {tree_digest:?}"))?;
                let tree = remexec::Tree::decode(&bytes[..])
                    .map_err(|e| format!("Corrupt Tree message {tree_digest:?}: {e}"))?;
                let root = tree
                    .root
                    .ok_or_else(|| format!("Tree message without root: {tree_digest:?}"))?;

                // Ingest the directory metadata locally: later walks of the output tree read
                // it from here while the file content stays remote.
                let cas = self.storage.cas();
                let root_digest = cas.store_tree(&root.encode_to_vec())?;
                for child in &tree.children {
                    cas.store_tree(&child.encode_to_vec())?;
                }
                Ok(root_digest)
            }
        }
    }
}

#[async_trait]
impl ExecutionApi for RemoteApi {
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
        let action_digest = action.digest(self.hash_function());

        if !skip_cache_lookup && !action.do_not_cache {
            // Local cache first: a hit short-circuits the remote lookup, as long as the
            // endpoint still holds everything the cached result references.
            if let Some(result) = self
                .storage
                .action_cache()
                .read(action_digest)
                .map_err(ExecutionApiError::Unclassified)?
            {
                match self.try_local_hit(action, action_digest, &result).await {
                    Ok(Some(response)) => return Ok(response),
                    Ok(None) => {}
                    Err(reason) => {
                        debug!(
                            "Treating local cache hit for {action_digest:?} as a miss: {reason}"
                        );
                    }
                }
            }

            if let Some(result) = self
                .action_cache
                .get_action_result(action_digest, &self.invocation_id, false)
                .await
                .map_err(ExecutionApiError::Unclassified)?
            {
                match self
                    .response_from_result(action, action_digest, &result, true)
                    .await
                {
                    Ok(response) => {
                        // The scheduler writes every accepted result into the local cache;
                        // keeping the remote hit there too makes the next lookup free.
                        self.storage
                            .action_cache()
                            .write(action_digest, &result)
                            .map_err(ExecutionApiError::Unclassified)?;
                        return Ok(response);
                    }
                    Err(reason) => {
                        debug!(
                            "Treating remote cache hit for {action_digest:?} as a miss: {reason}"
                        );
                    }
                }
            }
        }

        self.upload_missing_inputs(action).await?;

        let execute_response = self
            .execution
            .execute(action_digest, skip_cache_lookup, &self.invocation_id)
            .await
            .map_err(|e| match e {
                ExecutionError::Timeout => ExecutionApiError::Timeout,
                ExecutionError::Precondition(msg) => ExecutionApiError::Precondition(msg),
                ExecutionError::Fatal(msg) => ExecutionApiError::Unclassified(msg),
            })?;

        let result = execute_response
            .result
            .as_ref()
            .ok_or_else(|| format!("ExecuteResponse without a result for {action_digest:?}"))?;

        let response = self
            .response_from_result(action, action_digest, result, execute_response.cached_result)
            .await?;

        // Local AC write is unconditional for successful results; the remote cache was
        // already populated by the executor.
        if response.exit_code == 0 && !action.do_not_cache {
            self.storage
                .action_cache()
                .write(action_digest, result)
                .map_err(ExecutionApiError::Unclassified)?;
        }

        Ok(response)
    }

    async fn upload(
        &self,
        blobs: Vec<(Digest, Bytes)>,
        skip_find_missing: bool,
    ) -> Result<(), String> {
        // Keep a local copy: assembling upload sets and walking output trees read through
        // local storage, and everything uploaded stays resolvable after the endpoint GCs.
        let cas = self.storage.cas();
        for (digest, bytes) in &blobs {
            cas.store_verified(*digest, bytes)?;
        }
        self.byte_store.store_blobs(blobs, skip_find_missing).await
    }

    async fn is_available(&self, infos: &[ObjectInfo]) -> Result<Vec<ObjectInfo>, String> {
        let missing = self
            .byte_store
            .find_missing_digests(infos.iter().map(|info| info.digest))
            .await?;
        Ok(infos
            .iter()
            .filter(|info| missing.contains(&info.digest))
            .copied()
            .collect())
    }

    async fn read_object(&self, info: &ObjectInfo) -> Result<Option<Bytes>, String> {
        // Tree metadata ingested from Tree messages lives locally; everything else comes
        // from the remote CAS.
        if info.object_type.is_tree() {
            if let Some(bytes) = self.storage.cas().read_tree(info.digest)? {
                return Ok(Some(bytes));
            }
        }
        self.byte_store.load_object(info).await
    }
}
