// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use grpc_util::retry::RetryConfig;
use hashing::HashFunction;

use crate::git_hashes::GitHashesConverter;
use crate::progress::ActiveTargets;
use crate::statistics::Statistics;

///
/// The per-invocation state threaded through the scheduler and the executors. The hash
/// function is fixed at construction and never changes mid-process; everything that was ever
/// tempting to make a global lives here instead.
///
pub struct Context {
    pub hash_function: HashFunction,
    /// Build parallelism: how many actions may run at once.
    pub jobs: usize,
    pub retry: RetryConfig,
    pub statistics: Arc<Statistics>,
    pub active_targets: Arc<ActiveTargets>,
    pub git_hashes: GitHashesConverter,
    /// Source roots by repository name; the empty name is the main repository.
    pub repository_roots: HashMap<String, PathBuf>,
    /// Identifies this invocation in remote request metadata.
    pub invocation_id: String,
}

impl Context {
    pub fn new(hash_function: HashFunction, main_repository_root: PathBuf) -> Context {
        let mut repository_roots = HashMap::new();
        repository_roots.insert(String::new(), main_repository_root);
        Context {
            hash_function,
            jobs: num_cpus::get(),
            retry: RetryConfig::default(),
            statistics: Arc::new(Statistics::new()),
            active_targets: Arc::new(ActiveTargets::new()),
            git_hashes: GitHashesConverter::new(),
            repository_roots,
            invocation_id: format!("mason-{}", std::process::id()),
        }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Context {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Context {
        self.retry = retry;
        self
    }

    pub fn add_repository(mut self, name: &str, root: PathBuf) -> Context {
        self.repository_roots.insert(name.to_string(), root);
        self
    }

    pub fn repository_root(&self, name: &str) -> Result<&PathBuf, String> {
        self.repository_roots
            .get(name)
            .ok_or_else(|| format!("Unknown repository {name:?}"))
    }
}
