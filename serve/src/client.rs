// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use tonic::Request;

use grpc_util::retry::{retry_call_grpc, RetryConfig};
use grpc_util::{status_to_str, LayeredService};
use hashing::Digest;
use protos::gen::mason::serve as serve_proto;
use remote::RemoteOptions;
use serve_proto::configuration_client::ConfigurationClient;
use serve_proto::source_tree_client::SourceTreeClient;
use serve_proto::target_client::TargetClient;

use crate::ServeOutcome;

fn outcome_of<T>(status: i32, value: T) -> ServeOutcome<T> {
    match serve_proto::ServeStatus::try_from(status) {
        Ok(serve_proto::ServeStatus::Ok) => ServeOutcome::Ok(value),
        Ok(serve_proto::ServeStatus::NotFound) => ServeOutcome::NotFound,
        Ok(serve_proto::ServeStatus::SyncError) => {
            ServeOutcome::Fatal("serve endpoint failed to synchronize the result".to_string())
        }
        Ok(serve_proto::ServeStatus::InternalError) | Err(_) => {
            ServeOutcome::Fatal("serve endpoint reported an internal error".to_string())
        }
    }
}

///
/// A client of one serve endpoint. Every call is wrapped by the retry layer; lookups report
/// found / not-found / fatal rather than folding misses into errors.
///
pub struct ServeApi {
    source_tree: SourceTreeClient<LayeredService>,
    target: TargetClient<LayeredService>,
    configuration: ConfigurationClient<LayeredService>,
    retry: RetryConfig,
    /// The remote-execution endpoint this client builds against, for the pairing check.
    remote_execution_address: Option<String>,
}

impl ServeApi {
    pub fn new(
        options: &RemoteOptions,
        remote_execution_address: Option<String>,
    ) -> Result<ServeApi, String> {
        let channel = remote::connect_layered(options)?;
        Ok(ServeApi {
            source_tree: SourceTreeClient::new(channel.clone()),
            target: TargetClient::new(channel.clone()),
            configuration: ConfigurationClient::new(channel),
            retry: options.retry,
            remote_execution_address,
        })
    }

    ///
    /// Verify that the serve endpoint builds against the same remote-execution endpoint as
    /// this client; serving digests into a different CAS would be useless at best.
    ///
    pub async fn check_serve_remote_execution(&self) -> Result<(), String> {
        let response = retry_call_grpc(self.retry, "RemoteExecutionEndpoint", |_| {
            let mut client = self.configuration.clone();
            async move {
                client
                    .remote_execution_endpoint(Request::new(
                        serve_proto::RemoteExecutionEndpointRequest {},
                    ))
                    .await
            }
        })
        .await
        .map_err(status_to_str)?;

        let served = response.into_inner().address;
        match &self.remote_execution_address {
            Some(own) if *own == served => Ok(()),
            Some(own) => Err(format!(
                "Serve endpoint builds against {served:?}, this client against {own:?}"
            )),
            None if served.is_empty() => Ok(()),
            None => Err(format!(
                "Serve endpoint builds against {served:?}, this client executes locally"
            )),
        }
    }

    /// Whether the endpoint runs with compatible (SHA256) digests.
    pub async fn is_compatible(&self) -> Result<bool, String> {
        let response = retry_call_grpc(self.retry, "Compatibility", |_| {
            let mut client = self.configuration.clone();
            async move {
                client
                    .compatibility(Request::new(serve_proto::CompatibilityRequest {}))
                    .await
            }
        })
        .await
        .map_err(status_to_str)?;
        Ok(response.into_inner().compatible)
    }

    /// Resolve a commit (and optional subdirectory) to a tree identifier.
    pub async fn serve_commit_tree(
        &self,
        commit: &str,
        subdir: &str,
        sync_tree: bool,
    ) -> Result<ServeOutcome<String>, String> {
        let request = serve_proto::ServeCommitTreeRequest {
            commit: commit.to_string(),
            subdir: subdir.to_string(),
            sync_tree,
        };
        let response = retry_call_grpc(self.retry, "ServeCommitTree", |_| {
            let mut client = self.source_tree.clone();
            let request = request.clone();
            async move { client.serve_commit_tree(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?
        .into_inner();
        Ok(outcome_of(response.status, response.tree))
    }

    /// Resolve the unpacked content of an archive to a tree identifier.
    pub async fn serve_archive_tree(
        &self,
        content: &str,
        archive_type: serve_proto::serve_archive_tree_request::ArchiveType,
        subdir: &str,
        sync_tree: bool,
    ) -> Result<ServeOutcome<String>, String> {
        let request = serve_proto::ServeArchiveTreeRequest {
            content: content.to_string(),
            archive_type: archive_type as i32,
            subdir: subdir.to_string(),
            resolve_symlinks: serve_proto::serve_archive_tree_request::SymlinksResolve::None
                as i32,
            sync_tree,
        };
        let response = retry_call_grpc(self.retry, "ServeArchiveTree", |_| {
            let mut client = self.source_tree.clone();
            let request = request.clone();
            async move { client.serve_archive_tree(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?
        .into_inner();
        Ok(outcome_of(response.status, response.tree))
    }

    /// Make a content blob available in the associated remote CAS.
    pub async fn serve_content(&self, content: &str) -> Result<ServeOutcome<()>, String> {
        let request = serve_proto::ServeContentRequest {
            content: content.to_string(),
        };
        let response = retry_call_grpc(self.retry, "ServeContent", |_| {
            let mut client = self.source_tree.clone();
            let request = request.clone();
            async move { client.serve_content(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?
        .into_inner();
        Ok(outcome_of(response.status, ()))
    }

    /// Make a tree available in the associated remote CAS.
    pub async fn serve_tree(&self, tree: &str) -> Result<ServeOutcome<()>, String> {
        let request = serve_proto::ServeTreeRequest {
            tree: tree.to_string(),
        };
        let response = retry_call_grpc(self.retry, "ServeTree", |_| {
            let mut client = self.source_tree.clone();
            let request = request.clone();
            async move { client.serve_tree(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?
        .into_inner();
        Ok(outcome_of(response.status, ()))
    }

    /// Check whether a root tree is known to the serve endpoint without transferring it.
    pub async fn check_root_tree(&self, tree: &str) -> Result<ServeOutcome<()>, String> {
        let request = serve_proto::CheckRootTreeRequest {
            tree: tree.to_string(),
        };
        let response = retry_call_grpc(self.retry, "CheckRootTree", |_| {
            let mut client = self.source_tree.clone();
            let request = request.clone();
            async move { client.check_root_tree(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?
        .into_inner();
        Ok(outcome_of(response.status, ()))
    }

    /// Ask the serve endpoint to pull a tree from the associated remote CAS.
    pub async fn get_remote_tree(&self, tree: &str) -> Result<ServeOutcome<()>, String> {
        let request = serve_proto::GetRemoteTreeRequest {
            tree: tree.to_string(),
        };
        let response = retry_call_grpc(self.retry, "GetRemoteTree", |_| {
            let mut client = self.source_tree.clone();
            let request = request.clone();
            async move { client.get_remote_tree(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?
        .into_inner();
        Ok(outcome_of(response.status, ()))
    }

    ///
    /// Look up a target-cache entry by key. On a hit the entry blob and everything it
    /// references are resident in the associated remote CAS.
    ///
    pub async fn serve_target(
        &self,
        key: Digest,
    ) -> Result<ServeOutcome<Digest>, String> {
        let request = serve_proto::ServeTargetRequest {
            target_cache_key_id: Some(key.into()),
        };
        let response = retry_call_grpc(self.retry, "ServeTarget", |_| {
            let mut client = self.target.clone();
            let request = request.clone();
            async move { client.serve_target(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?
        .into_inner();

        match outcome_of(response.status, ()) {
            ServeOutcome::Ok(()) => {
                let digest = protos::require_digest(response.target_value.as_ref())?;
                Ok(ServeOutcome::Ok(digest))
            }
            ServeOutcome::NotFound => Ok(ServeOutcome::NotFound),
            ServeOutcome::Fatal(_) if !response.error_message.is_empty() => {
                Ok(ServeOutcome::Fatal(response.error_message))
            }
            ServeOutcome::Fatal(msg) => Ok(ServeOutcome::Fatal(msg)),
        }
    }

    /// The flexible configuration variables of an export target.
    pub async fn serve_target_variables(
        &self,
        root_tree: &str,
        target_file: &str,
        target: &str,
    ) -> Result<Option<Vec<String>>, String> {
        let request = serve_proto::ServeTargetVariablesRequest {
            root_tree: root_tree.to_string(),
            target_file: target_file.to_string(),
            target: target.to_string(),
        };
        let response = retry_call_grpc(self.retry, "ServeTargetVariables", |_| {
            let mut client = self.target.clone();
            let request = request.clone();
            async move { client.serve_target_variables(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?
        .into_inner();
        match outcome_of(response.status, response.flexible_config) {
            ServeOutcome::Ok(config) => Ok(Some(config)),
            ServeOutcome::NotFound => Ok(None),
            ServeOutcome::Fatal(msg) => Err(msg),
        }
    }
}
