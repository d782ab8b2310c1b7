// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use tonic::{Request, Response, Status};

use hashing::HashFunction;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use remexec::capabilities_server::Capabilities;

use crate::ServerState;

pub(crate) struct CapabilitiesService {
    state: Arc<ServerState>,
}

impl CapabilitiesService {
    pub(crate) fn new(state: Arc<ServerState>) -> CapabilitiesService {
        CapabilitiesService { state }
    }
}

#[tonic::async_trait]
impl Capabilities for CapabilitiesService {
    async fn get_capabilities(
        &self,
        _request: Request<remexec::GetCapabilitiesRequest>,
    ) -> Result<Response<remexec::ServerCapabilities>, Status> {
        let digest_function = match self.state.storage.hash_function() {
            HashFunction::Native => remexec::digest_function::Value::Sha1,
            HashFunction::Compatible => remexec::digest_function::Value::Sha256,
        };
        Ok(Response::new(remexec::ServerCapabilities {
            cache_capabilities: Some(remexec::CacheCapabilities {
                digest_functions: vec![digest_function as i32],
                action_cache_update_capabilities: Some(remexec::ActionCacheUpdateCapabilities {
                    update_enabled: true,
                }),
                max_batch_total_size_bytes: remote::MAX_BATCH_TRANSFER_SIZE as i64,
                symlink_absolute_path_strategy:
                    remexec::symlink_absolute_path_strategy::Value::Disallowed as i32,
                ..remexec::CacheCapabilities::default()
            }),
            execution_capabilities: Some(remexec::ExecutionCapabilities {
                digest_function: digest_function as i32,
                exec_enabled: true,
                ..remexec::ExecutionCapabilities::default()
            }),
            low_api_version: Some(protos::gen::build::bazel::semver::SemVer {
                major: 2,
                ..protos::gen::build::bazel::semver::SemVer::default()
            }),
            high_api_version: Some(protos::gen::build::bazel::semver::SemVer {
                major: 2,
                minor: 3,
                ..protos::gen::build::bazel::semver::SemVer::default()
            }),
            ..remexec::ServerCapabilities::default()
        }))
    }
}
