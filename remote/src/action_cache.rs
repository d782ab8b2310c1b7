// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use log::debug;
use tonic::{Code, Request};

use grpc_util::retry::{retry_call_grpc, RetryConfig};
use grpc_util::{status_to_str, LayeredService};
use hashing::Digest;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use remexec::action_cache_client::ActionCacheClient;

use crate::{apply_request_metadata, connect_layered, RemoteOptions};

///
/// A client for the remote action cache: action digest in, `ActionResult` out. `NOT_FOUND` is
/// an ordinary miss; everything else propagates through the retry wrapper.
///
pub struct RemoteActionCache {
    instance_name: Option<String>,
    retry: RetryConfig,
    client: Arc<ActionCacheClient<LayeredService>>,
}

impl RemoteActionCache {
    pub fn new(options: &RemoteOptions) -> Result<RemoteActionCache, String> {
        let channel = connect_layered(options)?;
        Ok(RemoteActionCache {
            instance_name: options.instance_name.clone(),
            retry: options.retry,
            client: Arc::new(ActionCacheClient::new(channel)),
        })
    }

    pub async fn get_action_result(
        &self,
        action_digest: Digest,
        invocation_id: &str,
        inline_stdout_stderr: bool,
    ) -> Result<Option<remexec::ActionResult>, String> {
        let request = remexec::GetActionResultRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            action_digest: Some(action_digest.into()),
            inline_stdout: inline_stdout_stderr,
            inline_stderr: inline_stdout_stderr,
            ..remexec::GetActionResultRequest::default()
        };

        let response = retry_call_grpc(self.retry, "GetActionResult", |_| {
            let mut client = self.client.as_ref().clone();
            let request =
                apply_request_metadata(Request::new(request.clone()), invocation_id);
            async move { client.get_action_result(request).await }
        })
        .await;

        match response {
            Ok(response) => Ok(Some(response.into_inner())),
            Err(status) if status.code() == Code::NotFound => {
                debug!("Remote action cache miss for {action_digest:?}");
                Ok(None)
            }
            Err(status) => Err(status_to_str(status)),
        }
    }

    pub async fn update_action_result(
        &self,
        action_digest: Digest,
        result: remexec::ActionResult,
    ) -> Result<(), String> {
        let request = remexec::UpdateActionResultRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            action_digest: Some(action_digest.into()),
            action_result: Some(result),
            ..remexec::UpdateActionResultRequest::default()
        };

        retry_call_grpc(self.retry, "UpdateActionResult", |_| {
            let mut client = self.client.as_ref().clone();
            let request = request.clone();
            async move { client.update_action_result(Request::new(request)).await }
        })
        .await
        .map(|_| ())
        .map_err(status_to_str)
    }
}
