// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The graph traverser: a readiness-driven, bounded-parallel walk of the action DAG. An
//! action runs once every producer of its inputs has finished; results propagate through a
//! shared artifact map. Failures stop the affected subtree only; independent work keeps
//! going and the build reports per-action diagnostics at the end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use artifact::{ActionId, ActionKind, ArtifactDescription, ArtifactId};
use execution::{ExecutionApi, ExecutionResponse};
use fs::tree_builder::{CollectingSink, DirectoryTree, TreeEntry};
use fs::{ObjectInfo, ObjectType};
use graph::DependencyGraph;
use hashing::Digest;

use crate::context::Context;
use crate::ExitCode;

/// How much stderr is inlined into an action-failure diagnostic.
const STDERR_EXCERPT_BYTES: usize = 4096;

///
/// Whether and how actions are re-executed to detect flakiness.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RebuildMode {
    /// Use caches normally.
    Normal,
    /// Re-run every action with the cache lookup skipped and compare against the first
    /// result; disagreement is counted and reported.
    Rebuild,
    /// Like `Rebuild`, but a disagreement fails the build.
    RebuildStrict,
}

///
/// The result of one traversal.
///
#[derive(Debug)]
pub struct BuildOutcome {
    pub exit_code: ExitCode,
    /// Every artifact resolved during the build, goals included.
    pub artifacts: HashMap<ArtifactId, ObjectInfo>,
    pub failed_actions: Vec<(ActionId, String)>,
}

pub struct GraphTraverser {
    graph: Arc<DependencyGraph>,
    api: Arc<dyn ExecutionApi>,
    context: Arc<Context>,
    rebuild_mode: RebuildMode,
    shutdown: Arc<AtomicBool>,
}

impl GraphTraverser {
    pub fn new(
        graph: Arc<DependencyGraph>,
        api: Arc<dyn ExecutionApi>,
        context: Arc<Context>,
    ) -> GraphTraverser {
        GraphTraverser {
            graph,
            api,
            context,
            rebuild_mode: RebuildMode::Normal,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_rebuild_mode(mut self, mode: RebuildMode) -> GraphTraverser {
        self.rebuild_mode = mode;
        self
    }

    /// Stop picking new actions; in-flight work drains normally.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    ///
    /// Build the given goal artifacts. Returns the artifacts resolved, the per-action
    /// failure diagnostics, and the exit code summarizing the outcome.
    ///
    pub async fn build(&self, goals: &[ArtifactId]) -> Result<BuildOutcome, String> {
        let required = self.graph.required_actions(goals)?;

        // Readiness: an action is ready once every distinct builder among its inputs has
        // finished. Dependents are notified as results land.
        let mut pending: HashMap<ActionId, usize> = HashMap::new();
        let mut dependents: HashMap<ActionId, Vec<ActionId>> = HashMap::new();
        for action_id in &required {
            let node = self
                .graph
                .action(action_id)
                .ok_or_else(|| format!("Unknown action {action_id:?}"))?;
            let mut producers: HashSet<ActionId> = HashSet::new();
            for (_, input_id) in &node.inputs {
                let artifact = self
                    .graph
                    .artifact(input_id)
                    .ok_or_else(|| format!("Unknown artifact {input_id}"))?;
                if let Some(builder) = &artifact.builder {
                    producers.insert(builder.clone());
                }
            }
            for producer in &producers {
                dependents
                    .entry(producer.clone())
                    .or_default()
                    .push(action_id.clone());
            }
            pending.insert(action_id.clone(), producers.len());
        }

        let results: Arc<Mutex<HashMap<ArtifactId, ObjectInfo>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let semaphore = Arc::new(Semaphore::new(self.context.jobs));
        let mut failed_actions: Vec<(ActionId, String)> = Vec::new();

        let mut running = FuturesUnordered::new();
        for (action_id, count) in &pending {
            if *count == 0 {
                running.push(self.run_action(action_id.clone(), results.clone(), semaphore.clone()));
            }
        }

        while let Some((action_id, result)) = running.next().await {
            match result {
                Ok(outputs) => {
                    {
                        let mut results = results.lock();
                        for (artifact_id, info) in outputs {
                            results.insert(artifact_id, info);
                        }
                    }
                    for dependent in dependents.get(&action_id).into_iter().flatten() {
                        let count = pending
                            .get_mut(dependent)
                            .expect("dependents are required actions");
                        *count -= 1;
                        if *count == 0 && !self.shutdown.load(Ordering::SeqCst) {
                            running.push(self.run_action(
                                dependent.clone(),
                                results.clone(),
                                semaphore.clone(),
                            ));
                        }
                    }
                }
                Err(message) => {
                    self.context.statistics.increment_failed();
                    warn!("Action {action_id:?} failed: {message}");
                    failed_actions.push((action_id, message));
                }
            }
        }

        // Goals that are sources or known blobs resolve without any action having run.
        let mut missing_goals = Vec::new();
        for goal in goals {
            let resolved = { results.lock().get(goal).copied() };
            if resolved.is_some() {
                continue;
            }
            match self.resolve_leaf_artifact(goal).await {
                Ok(Some(info)) => {
                    results.lock().insert(goal.clone(), info);
                }
                Ok(None) => missing_goals.push(goal.clone()),
                Err(e) => return Err(e),
            }
        }

        let exit_code = if failed_actions.is_empty() {
            if missing_goals.is_empty() {
                ExitCode::Success
            } else {
                debug!("Build succeeded but goals were not produced: {missing_goals:?}");
                ExitCode::MissingArtifacts
            }
        } else {
            ExitCode::Failure
        };

        let artifacts = Arc::try_unwrap(results)
            .map(|mutex| mutex.into_inner())
            .unwrap_or_else(|arc| arc.lock().clone());
        Ok(BuildOutcome {
            exit_code,
            artifacts,
            failed_actions,
        })
    }

    async fn run_action(
        &self,
        action_id: ActionId,
        results: Arc<Mutex<HashMap<ArtifactId, ObjectInfo>>>,
        semaphore: Arc<Semaphore>,
    ) -> (ActionId, Result<Vec<(ArtifactId, ObjectInfo)>, String>) {
        let _permit = semaphore.acquire().await.expect("semaphore never closes");
        self.context.statistics.increment_queued();
        self.context.active_targets.insert(&action_id);
        let result = self.process_action(&action_id, &results).await;
        self.context.active_targets.remove(&action_id);
        (action_id, result)
    }

    async fn process_action(
        &self,
        action_id: &ActionId,
        results: &Mutex<HashMap<ArtifactId, ObjectInfo>>,
    ) -> Result<Vec<(ArtifactId, ObjectInfo)>, String> {
        let node = self
            .graph
            .action(action_id)
            .ok_or_else(|| format!("Unknown action {action_id:?}"))?;

        // Assemble the input root: every input artifact at its in-action path.
        let mut entries = Vec::with_capacity(node.inputs.len());
        for (path, input_id) in &node.inputs {
            let info = self.resolve_input(input_id, results).await?;
            let entry = match info.object_type {
                ObjectType::Tree => TreeEntry::Tree { digest: info.digest },
                ObjectType::Symlink => {
                    let target = self.api.retrieve_to_memory(&info).await?;
                    TreeEntry::Symlink {
                        target: String::from_utf8(target.to_vec())
                            .map_err(|e| format!("Symlink target is not UTF-8: {e}"))?,
                    }
                }
                ObjectType::File | ObjectType::Executable => TreeEntry::Blob {
                    digest: info.digest,
                    executable: info.object_type.is_executable(),
                },
            };
            entries.push((path.clone(), entry));
        }
        let tree = DirectoryTree::from_entries(entries)?;
        let mut sink = CollectingSink::default();
        let input_root = tree.write(self.context.hash_function, &mut sink)?;

        let mut tree_objects: Vec<(Digest, Bytes)> = sink.blobs;
        tree_objects.extend(sink.trees);
        self.api.upload(tree_objects, false).await?;

        match &node.description.kind {
            ActionKind::Tree => {
                let info = ObjectInfo::new(input_root, ObjectType::Tree);
                Ok(node
                    .outputs
                    .iter()
                    .map(|(_, artifact_id)| (artifact_id.clone(), info))
                    .collect())
            }
            ActionKind::Command(spec) => {
                let action = self.api.create_action(
                    input_root,
                    spec.command.clone(),
                    spec.output_files.clone(),
                    spec.output_dirs.clone(),
                    spec.env.clone(),
                    spec.execution_properties.clone(),
                    spec.timeout,
                    spec.no_cache,
                );

                let response = self
                    .api
                    .execute(&action, false)
                    .await
                    .map_err(|e| e.to_string())?;

                if response.cached {
                    self.context.statistics.increment_cached();
                } else {
                    self.context.statistics.increment_executed();
                }

                if self.rebuild_mode != RebuildMode::Normal && !spec.no_cache {
                    self.detect_flakiness(action_id, &action, &response).await?;
                }

                if response.exit_code != 0 {
                    return Err(self.action_failure_message(&response).await);
                }

                let mut outputs = Vec::with_capacity(node.outputs.len());
                for (path, artifact_id) in &node.outputs {
                    let path = path.to_string();
                    let info = response.artifacts.get(&path).ok_or_else(|| {
                        format!("Action {action_id:?} did not produce declared output {path:?}")
                    })?;
                    outputs.push((artifact_id.clone(), *info));
                }
                Ok(outputs)
            }
        }
    }

    ///
    /// Re-run the action bypassing the caches and compare the two results digest by digest.
    /// A disagreement classifies the action as flaky; it fails the build only under strict
    /// rebuild mode.
    ///
    async fn detect_flakiness(
        &self,
        action_id: &ActionId,
        action: &execution::Action,
        first: &ExecutionResponse,
    ) -> Result<(), String> {
        let second = self
            .api
            .execute(action, true)
            .await
            .map_err(|e| e.to_string())?;
        if second.artifacts == first.artifacts {
            return Ok(());
        }
        self.context.statistics.increment_flaky();
        let detail = format!(
            "Action {action_id:?} is flaky: two executions of {:?} disagree",
            first.action_digest
        );
        warn!("{detail}");
        for (path, info) in &first.artifacts {
            if let Some(other) = second.artifacts.get(path) {
                if other != info {
                    warn!("  output {path:?}: {info} vs {other}");
                }
            }
        }
        if self.rebuild_mode == RebuildMode::RebuildStrict {
            return Err(detail);
        }
        Ok(())
    }

    async fn action_failure_message(&self, response: &ExecutionResponse) -> String {
        let mut message = format!(
            "Action {:?} failed with exit code {}",
            response.action_digest, response.exit_code
        );
        let stderr_info = ObjectInfo::new(response.stderr_digest, ObjectType::File);
        if let Ok(stderr) = self.api.retrieve_to_memory(&stderr_info).await {
            if !stderr.is_empty() {
                let excerpt = &stderr[..stderr.len().min(STDERR_EXCERPT_BYTES)];
                message.push_str(&format!(
                    "\nstderr:\n{}",
                    String::from_utf8_lossy(excerpt)
                ));
            }
        }
        message
    }

    ///
    /// Resolve an input artifact: already built outputs come from the result map; sources
    /// and known artifacts resolve on first use.
    ///
    async fn resolve_input(
        &self,
        artifact_id: &ArtifactId,
        results: &Mutex<HashMap<ArtifactId, ObjectInfo>>,
    ) -> Result<ObjectInfo, String> {
        if let Some(info) = results.lock().get(artifact_id) {
            return Ok(*info);
        }
        match self.resolve_leaf_artifact(artifact_id).await? {
            Some(info) => {
                results.lock().insert(artifact_id.clone(), info);
                Ok(info)
            }
            None => Err(format!(
                "Input artifact {artifact_id} was not produced by its action"
            )),
        }
    }

    /// Resolve an artifact that needs no action: a local source (hashed and made available
    /// to the backend) or a known blob. Action outputs yield None here.
    async fn resolve_leaf_artifact(
        &self,
        artifact_id: &ArtifactId,
    ) -> Result<Option<ObjectInfo>, String> {
        let node = self
            .graph
            .artifact(artifact_id)
            .ok_or_else(|| format!("Unknown artifact {artifact_id}"))?;
        match &node.description {
            ArtifactDescription::Known { info } => Ok(Some(*info)),
            ArtifactDescription::Local { path, repository } => {
                let root = self.context.repository_root(repository)?;
                let full_path = root.join(path);
                let metadata = std::fs::metadata(&full_path)
                    .map_err(|e| format!("Failed to stat source {full_path:?}: {e}"))?;
                let bytes = std::fs::read(&full_path)
                    .map_err(|e| format!("Failed to read source {full_path:?}: {e}"))?;
                let digest = self.context.hash_function.hash_blob(&bytes);
                self.api.upload(vec![(digest, Bytes::from(bytes))], false).await?;
                use std::os::unix::fs::PermissionsExt;
                let executable = metadata.permissions().mode() & 0o100 != 0;
                Ok(Some(ObjectInfo::new(
                    digest,
                    ObjectType::from_exec_flag(executable),
                )))
            }
            ArtifactDescription::Action { .. } | ArtifactDescription::Tree { .. } => Ok(None),
        }
    }
}
