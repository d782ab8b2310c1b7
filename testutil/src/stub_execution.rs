// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::oneshot;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::longrunning::{operation, Operation};
use remexec::execution_server::{Execution, ExecutionServer};

#[derive(Clone)]
struct Shared {
    responses: Arc<Mutex<HashMap<String, remexec::ExecuteResponse>>>,
    /// Close this many operation streams before the operation is done, forcing clients onto
    /// `WaitExecution`.
    streams_to_drop: Arc<Mutex<usize>>,
    execute_calls: Arc<Mutex<usize>>,
    wait_calls: Arc<Mutex<usize>>,
}

///
/// A stub Execution service: maps action digests to canned `ExecuteResponse`s and can drop
/// operation streams early to exercise the reconnect path.
///
pub struct StubExecution {
    pub address: String,
    shared: Shared,
    _shutdown: oneshot::Sender<()>,
}

impl StubExecution {
    pub async fn new(drop_first_streams: usize) -> StubExecution {
        let shared = Shared {
            responses: Arc::new(Mutex::new(HashMap::new())),
            streams_to_drop: Arc::new(Mutex::new(drop_first_streams)),
            execute_calls: Arc::new(Mutex::new(0)),
            wait_calls: Arc::new(Mutex::new(0)),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind stub execution port");
        let local_addr = listener.local_addr().expect("listener has a local addr");
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

        let service = shared.clone();
        tokio::spawn(async move {
            Server::builder()
                .add_service(ExecutionServer::new(service))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_receiver.await;
                })
                .await
                .expect("stub execution server failed");
        });

        StubExecution {
            address: format!("http://{local_addr}"),
            shared,
            _shutdown: shutdown_sender,
        }
    }

    pub fn set_response(&self, action_hash_hex: &str, response: remexec::ExecuteResponse) {
        self.shared
            .responses
            .lock()
            .insert(action_hash_hex.to_string(), response);
    }

    pub fn execute_calls(&self) -> usize {
        *self.shared.execute_calls.lock()
    }

    pub fn wait_calls(&self) -> usize {
        *self.shared.wait_calls.lock()
    }
}

fn done_operation(name: &str, response: &remexec::ExecuteResponse) -> Operation {
    Operation {
        name: name.to_string(),
        done: true,
        result: Some(operation::Result::Response(prost_types_any(response))),
        ..Operation::default()
    }
}

fn prost_types_any(response: &remexec::ExecuteResponse) -> prost_types::Any {
    prost_types::Any {
        type_url: "type.googleapis.com/build.bazel.remote.execution.v2.ExecuteResponse"
            .to_string(),
        value: response.encode_to_vec(),
    }
}

impl Shared {
    fn operation_stream(
        &self,
        name: String,
    ) -> futures::stream::BoxStream<'static, Result<Operation, Status>> {
        let response = self.responses.lock().get(&name).cloned();
        let drop_early = {
            let mut remaining = self.streams_to_drop.lock();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };

        let stream = async_stream::stream! {
            yield Ok(Operation {
                name: name.clone(),
                done: false,
                ..Operation::default()
            });
            if drop_early {
                // End the stream without completing the operation.
                return;
            }
            match response {
                Some(response) => yield Ok(done_operation(&name, &response)),
                None => yield Err(Status::not_found(format!("no canned response for {name}"))),
            }
        };
        stream.boxed()
    }
}

#[tonic::async_trait]
impl Execution for Shared {
    type ExecuteStream = futures::stream::BoxStream<'static, Result<Operation, Status>>;
    type WaitExecutionStream = futures::stream::BoxStream<'static, Result<Operation, Status>>;

    async fn execute(
        &self,
        request: Request<remexec::ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        *self.execute_calls.lock() += 1;
        let digest = request
            .into_inner()
            .action_digest
            .ok_or_else(|| Status::invalid_argument("missing action_digest"))?;
        Ok(Response::new(self.operation_stream(digest.hash)))
    }

    async fn wait_execution(
        &self,
        request: Request<remexec::WaitExecutionRequest>,
    ) -> Result<Response<Self::WaitExecutionStream>, Status> {
        *self.wait_calls.lock() += 1;
        let name = request.into_inner().name;
        Ok(Response::new(self.operation_stream(name)))
    }
}
