// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use log::{debug, trace};
use prost::Message;
use tonic::{Code, Request, Status};

use grpc_util::retry::{status_is_retryable, RetryConfig};
use grpc_util::{status_ref_to_str, LayeredService};
use hashing::Digest;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::longrunning::{operation, Operation};
use remexec::execution_client::ExecutionClient as ExecutionGrpcClient;

use crate::{apply_request_metadata, connect_layered, RemoteOptions};

///
/// How a remote execution attempt failed. A completed action with a non-zero exit code is NOT
/// an error: the `ExecuteResponse` is surfaced verbatim.
///
#[derive(Debug)]
pub enum ExecutionError {
    /// The action genuinely exceeded its deadline on the worker. Not retried.
    Timeout,
    /// The server rejected the action's preconditions, typically missing inputs.
    Precondition(String),
    Fatal(String),
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::Timeout => write!(f, "action exceeded its deadline"),
            ExecutionError::Precondition(msg) => write!(f, "precondition failed: {msg}"),
            ExecutionError::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

enum StreamOutcome {
    /// The operation finished, successfully or not.
    Complete(Box<Operation>),
    /// The stream ended or broke before the operation finished.
    Reconnect(Option<String>),
    /// The stream failed with a status the caller decides about.
    Failed(Status),
}

///
/// A client for the remote Execution service: submits an action digest and follows the
/// long-running operation stream (reconnecting through `WaitExecution` when it drops) until a
/// final `ExecuteResponse` arrives.
///
pub struct ExecutionClient {
    instance_name: Option<String>,
    retry: RetryConfig,
    client: Arc<ExecutionGrpcClient<LayeredService>>,
}

impl ExecutionClient {
    pub fn new(options: &RemoteOptions) -> Result<ExecutionClient, String> {
        let channel = connect_layered(options)?;
        Ok(ExecutionClient {
            instance_name: options.instance_name.clone(),
            retry: options.retry,
            client: Arc::new(ExecutionGrpcClient::new(channel)),
        })
    }

    pub async fn execute(
        &self,
        action_digest: Digest,
        skip_cache_lookup: bool,
        invocation_id: &str,
    ) -> Result<remexec::ExecuteResponse, ExecutionError> {
        let request = remexec::ExecuteRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            skip_cache_lookup,
            action_digest: Some(action_digest.into()),
            ..remexec::ExecuteRequest::default()
        };

        let attempts = self.retry.max_attempts();
        let mut attempt = 1;
        let mut operation_name: Option<String> = None;
        loop {
            let outcome = match &operation_name {
                None => self.open_execute_stream(&request, invocation_id).await,
                Some(name) => self.open_wait_stream(name).await,
            };

            match outcome {
                StreamOutcome::Complete(operation) => {
                    return Self::extract_response(action_digest, *operation)
                }
                StreamOutcome::Reconnect(name) => {
                    // The server closed the stream without finishing the operation: reconnect
                    // without consuming an attempt; the work is still running remotely.
                    debug!(
                        "Execution stream for {action_digest:?} closed early; reconnecting ({})",
                        name.as_deref().unwrap_or("via Execute")
                    );
                    operation_name = name;
                }
                StreamOutcome::Failed(status) if status_is_retryable(&status) => {
                    if attempt >= attempts {
                        return Err(ExecutionError::Fatal(format!(
                            "Executing {action_digest:?} failed after {attempt} attempts: {}",
                            status_ref_to_str(&status)
                        )));
                    }
                    tokio::time::sleep(self.retry.sleep_time(attempt)).await;
                    attempt += 1;
                    operation_name = None;
                }
                StreamOutcome::Failed(status) => {
                    return Err(Self::classify_status(status));
                }
            }
        }
    }

    async fn open_execute_stream(
        &self,
        request: &remexec::ExecuteRequest,
        invocation_id: &str,
    ) -> StreamOutcome {
        let mut client = self.client.as_ref().clone();
        let request = apply_request_metadata(Request::new(request.clone()), invocation_id);
        match client.execute(request).await {
            Ok(response) => Self::consume_stream(response.into_inner()).await,
            Err(status) => StreamOutcome::Failed(status),
        }
    }

    async fn open_wait_stream(&self, operation_name: &str) -> StreamOutcome {
        let mut client = self.client.as_ref().clone();
        let request = remexec::WaitExecutionRequest {
            name: operation_name.to_string(),
        };
        match client.wait_execution(Request::new(request)).await {
            Ok(response) => Self::consume_stream(response.into_inner()).await,
            Err(status) if status.code() == Code::NotFound => {
                // The server no longer knows the operation: start over with Execute.
                StreamOutcome::Reconnect(None)
            }
            Err(status) => StreamOutcome::Failed(status),
        }
    }

    async fn consume_stream(
        mut stream: tonic::Streaming<Operation>,
    ) -> StreamOutcome {
        let mut operation_name = None;
        loop {
            match stream.message().await {
                Ok(Some(operation)) => {
                    trace!("operation stream item: {operation:?}");
                    if !operation.name.trim().is_empty() {
                        operation_name = Some(operation.name.clone());
                    }
                    if operation.done {
                        return StreamOutcome::Complete(Box::new(operation));
                    }
                }
                Ok(None) => return StreamOutcome::Reconnect(operation_name),
                Err(status) => return StreamOutcome::Failed(status),
            }
        }
    }

    fn extract_response(
        action_digest: Digest,
        operation: Operation,
    ) -> Result<remexec::ExecuteResponse, ExecutionError> {
        let response = match operation.result {
            Some(operation::Result::Error(status)) => {
                return Err(Self::classify_status(Status::new(
                    Code::from_i32(status.code),
                    status.message,
                )))
            }
            Some(operation::Result::Response(any)) => {
                remexec::ExecuteResponse::decode(&any.value[..]).map_err(|e| {
                    ExecutionError::Fatal(format!(
                        "Invalid ExecuteResponse for {action_digest:?}: {e}"
                    ))
                })?
            }
            None => {
                return Err(ExecutionError::Fatal(format!(
                    "Operation for {action_digest:?} finished without a result"
                )))
            }
        };

        let status = response.status.clone().unwrap_or_default();
        match Code::from_i32(status.code) {
            Code::Ok => Ok(response),
            // The action itself ran into its deadline: fatal for the action, never retried.
            Code::DeadlineExceeded => Err(ExecutionError::Timeout),
            Code::FailedPrecondition => {
                debug!(
                    "FAILED_PRECONDITION executing {action_digest:?}: full response: {response:?}"
                );
                Err(ExecutionError::Precondition(status.message))
            }
            code => Err(ExecutionError::Fatal(format!(
                "Remote execution of {action_digest:?} failed: {code:?}: {}",
                status.message
            ))),
        }
    }

    fn classify_status(status: Status) -> ExecutionError {
        match status.code() {
            Code::DeadlineExceeded => ExecutionError::Timeout,
            Code::FailedPrecondition => {
                debug!("FAILED_PRECONDITION: {}", status.message());
                ExecutionError::Precondition(status.message().to_string())
            }
            _ => ExecutionError::Fatal(status_ref_to_str(&status)),
        }
    }
}
