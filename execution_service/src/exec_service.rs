// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use futures::StreamExt;
use prost::Message;
use tonic::{Code, Request, Response, Status};

use execution::{Action, ExecutionApi, ExecutionApiError};
use grpc_util::prost::MessageExt;
use hashing::{Digest, HashFunction};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::longrunning::{operation, Operation};
use remexec::execution_server::Execution;

use crate::ServerState;

pub(crate) struct ExecService {
    state: Arc<ServerState>,
}

impl ExecService {
    pub(crate) fn new(state: Arc<ServerState>) -> ExecService {
        ExecService { state }
    }

    ///
    /// Reconstruct the action from its CAS-resident serialization: the canonical JSON in
    /// native mode, the protocol `Action` (reaching its `Command` by digest) in compatible
    /// mode. Anything missing is a precondition failure: the client did not upload what the
    /// request references.
    ///
    fn load_action(&self, action_digest: Digest) -> Result<Action, Status> {
        let cas = self.state.storage.cas();
        let serialized = cas
            .read_blob(action_digest)
            .map_err(Status::internal)?
            .ok_or_else(|| {
                Status::failed_precondition(format!(
                    "Action blob not in CAS: {action_digest:?}"
                ))
            })?;
        match self.state.storage.hash_function() {
            HashFunction::Native => {
                Action::from_native_json(&serialized).map_err(Status::failed_precondition)
            }
            HashFunction::Compatible => {
                let action_proto = remexec::Action::decode(&serialized[..])
                    .map_err(|e| Status::invalid_argument(format!("Corrupt Action: {e}")))?;
                let command_digest =
                    protos::require_digest(action_proto.command_digest.as_ref())
                        .map_err(Status::invalid_argument)?;
                let command_bytes = cas
                    .read_blob(command_digest)
                    .map_err(Status::internal)?
                    .ok_or_else(|| {
                        Status::failed_precondition(format!(
                            "Command blob not in CAS: {command_digest:?}"
                        ))
                    })?;
                let command = remexec::Command::decode(&command_bytes[..])
                    .map_err(|e| Status::invalid_argument(format!("Corrupt Command: {e}")))?;
                Action::from_protos(
                    &action_proto,
                    &command,
                    self.state.local.default_action_timeout(),
                )
                .map_err(Status::invalid_argument)
            }
        }
    }

    async fn run(&self, request: remexec::ExecuteRequest) -> Result<Operation, Status> {
        let action_digest = protos::require_digest(request.action_digest.as_ref())
            .map_err(Status::invalid_argument)?;
        let action = self.load_action(action_digest)?;

        if self
            .state
            .storage
            .cas()
            .read_tree(action.input_root_digest)
            .map_err(Status::internal)?
            .is_none()
        {
            return Err(Status::failed_precondition(format!(
                "Input root not in CAS: {:?}",
                action.input_root_digest
            )));
        }

        let execute_response = match self
            .state
            .local
            .execute_full(&action, request.skip_cache_lookup)
            .await
        {
            Ok((response, result)) => remexec::ExecuteResponse {
                result: Some(result),
                cached_result: response.cached,
                status: Some(protos::gen::google::rpc::Status::default()),
                ..remexec::ExecuteResponse::default()
            },
            // The action ran into its own deadline: a successful call reporting a timeout.
            Err(ExecutionApiError::Timeout) => remexec::ExecuteResponse {
                status: Some(protos::gen::google::rpc::Status {
                    code: Code::DeadlineExceeded as i32,
                    message: "action exceeded its timeout".to_string(),
                    details: vec![],
                }),
                ..remexec::ExecuteResponse::default()
            },
            Err(ExecutionApiError::MissingDigest(digest)) => {
                return Err(Status::failed_precondition(format!(
                    "Missing input: {digest:?}"
                )))
            }
            Err(ExecutionApiError::Precondition(msg)) => {
                return Err(Status::failed_precondition(msg))
            }
            Err(ExecutionApiError::Unclassified(msg)) => return Err(Status::internal(msg)),
        };

        let name = action_digest.hash.to_hex();
        self.state
            .operations
            .lock()
            .insert(name.clone(), execute_response.clone());

        Ok(done_operation(&name, &execute_response))
    }
}

fn done_operation(name: &str, response: &remexec::ExecuteResponse) -> Operation {
    Operation {
        name: name.to_string(),
        done: true,
        result: Some(operation::Result::Response(prost_types::Any {
            type_url: "type.googleapis.com/build.bazel.remote.execution.v2.ExecuteResponse"
                .to_string(),
            value: response.to_bytes().to_vec(),
        })),
        ..Operation::default()
    }
}

#[tonic::async_trait]
impl Execution for ExecService {
    type ExecuteStream = futures::stream::BoxStream<'static, Result<Operation, Status>>;
    type WaitExecutionStream = futures::stream::BoxStream<'static, Result<Operation, Status>>;

    async fn execute(
        &self,
        request: Request<remexec::ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let operation = self.run(request.into_inner()).await?;
        Ok(Response::new(
            futures::stream::iter(vec![Ok(operation)]).boxed(),
        ))
    }

    async fn wait_execution(
        &self,
        request: Request<remexec::WaitExecutionRequest>,
    ) -> Result<Response<Self::WaitExecutionStream>, Status> {
        let name = request.into_inner().name;
        let response = self
            .state
            .operations
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("Unknown operation {name:?}")))?;
        Ok(Response::new(
            futures::stream::iter(vec![Ok(done_operation(&name, &response))]).boxed(),
        ))
    }
}
