// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status, Streaming};

use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::bytestream::{
    byte_stream_server::{ByteStream, ByteStreamServer},
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};
use remexec::action_cache_server::{ActionCache, ActionCacheServer};
use remexec::capabilities_server::{Capabilities, CapabilitiesServer};
use remexec::content_addressable_storage_server::{
    ContentAddressableStorage, ContentAddressableStorageServer,
};

#[derive(Default)]
struct State {
    blobs: HashMap<String, Bytes>,
    partial_writes: HashMap<String, Vec<u8>>,
    completed_writes: HashMap<String, i64>,
    action_results: HashMap<String, remexec::ActionResult>,
    request_counts: HashMap<&'static str, usize>,
    /// Remaining number of writes to interrupt after `write_fail_after_bytes`.
    writes_to_interrupt: usize,
}

#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<State>>,
    batch_cap: i64,
    cas_always_errors: bool,
    write_fail_after_bytes: usize,
}

impl Shared {
    fn count(&self, rpc: &'static str) {
        *self.state.lock().request_counts.entry(rpc).or_insert(0) += 1;
    }
}

///
/// Builder for a stub CAS endpoint: a CAS + ByteStream + ActionCache + Capabilities server
/// bound to a local port, storing blobs in memory keyed by fingerprint.
///
pub struct StubCasBuilder {
    batch_cap: i64,
    cas_always_errors: bool,
    write_fail_after_bytes: usize,
    writes_to_interrupt: usize,
    preloaded: Vec<(String, Bytes)>,
}

impl StubCasBuilder {
    pub fn new() -> StubCasBuilder {
        StubCasBuilder {
            batch_cap: 0,
            cas_always_errors: false,
            write_fail_after_bytes: 0,
            writes_to_interrupt: 0,
            preloaded: Vec::new(),
        }
    }

    /// Advertise `cap` as `max_batch_total_size_bytes`.
    pub fn batch_cap(mut self, cap: i64) -> StubCasBuilder {
        self.batch_cap = cap;
        self
    }

    /// Every CAS and ByteStream call fails with UNAVAILABLE.
    pub fn always_errors(mut self) -> StubCasBuilder {
        self.cas_always_errors = true;
        self
    }

    /// Interrupt the next `count` ByteStream writes with UNAVAILABLE once `bytes` bytes have
    /// been committed, keeping the partial write for resumption.
    pub fn interrupt_writes(mut self, count: usize, bytes: usize) -> StubCasBuilder {
        self.writes_to_interrupt = count;
        self.write_fail_after_bytes = bytes;
        self
    }

    pub fn preload(mut self, hash_hex: &str, data: Bytes) -> StubCasBuilder {
        self.preloaded.push((hash_hex.to_string(), data));
        self
    }

    pub async fn build(self) -> StubCas {
        let mut state = State {
            writes_to_interrupt: self.writes_to_interrupt,
            ..State::default()
        };
        for (hash, data) in self.preloaded {
            state.blobs.insert(hash, data);
        }
        let shared = Shared {
            state: Arc::new(Mutex::new(state)),
            batch_cap: self.batch_cap,
            cas_always_errors: self.cas_always_errors,
            write_fail_after_bytes: self.write_fail_after_bytes,
        };
        StubCas::spawn(shared).await
    }
}

pub struct StubCas {
    pub address: String,
    state: Arc<Mutex<State>>,
    _shutdown: oneshot::Sender<()>,
}

impl StubCas {
    pub fn builder() -> StubCasBuilder {
        StubCasBuilder::new()
    }

    pub async fn empty() -> StubCas {
        StubCasBuilder::new().build().await
    }

    async fn spawn(shared: Shared) -> StubCas {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind stub CAS port");
        let local_addr = listener.local_addr().expect("listener has a local addr");
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();
        let state = shared.state.clone();

        tokio::spawn(async move {
            Server::builder()
                .add_service(ContentAddressableStorageServer::new(shared.clone()))
                .add_service(ByteStreamServer::new(shared.clone()))
                .add_service(ActionCacheServer::new(shared.clone()))
                .add_service(CapabilitiesServer::new(shared))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_receiver.await;
                })
                .await
                .expect("stub CAS server failed");
        });

        StubCas {
            address: format!("http://{local_addr}"),
            state,
            _shutdown: shutdown_sender,
        }
    }

    pub fn blob(&self, hash_hex: &str) -> Option<Bytes> {
        self.state.lock().blobs.get(hash_hex).cloned()
    }

    pub fn insert_blob(&self, hash_hex: &str, data: Bytes) {
        self.state.lock().blobs.insert(hash_hex.to_string(), data);
    }

    pub fn insert_action_result(&self, hash_hex: &str, result: remexec::ActionResult) {
        self.state
            .lock()
            .action_results
            .insert(hash_hex.to_string(), result);
    }

    pub fn request_count(&self, rpc: &str) -> usize {
        self.state
            .lock()
            .request_counts
            .get(rpc)
            .copied()
            .unwrap_or(0)
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for Shared {
    async fn find_missing_blobs(
        &self,
        request: Request<remexec::FindMissingBlobsRequest>,
    ) -> Result<Response<remexec::FindMissingBlobsResponse>, Status> {
        self.count("FindMissingBlobs");
        if self.cas_always_errors {
            return Err(Status::unavailable("injected CAS failure"));
        }
        let state = self.state.lock();
        let missing = request
            .into_inner()
            .blob_digests
            .into_iter()
            .filter(|digest| !state.blobs.contains_key(&digest.hash))
            .collect();
        Ok(Response::new(remexec::FindMissingBlobsResponse {
            missing_blob_digests: missing,
        }))
    }

    async fn batch_update_blobs(
        &self,
        request: Request<remexec::BatchUpdateBlobsRequest>,
    ) -> Result<Response<remexec::BatchUpdateBlobsResponse>, Status> {
        self.count("BatchUpdateBlobs");
        if self.cas_always_errors {
            return Err(Status::unavailable("injected CAS failure"));
        }
        let mut state = self.state.lock();
        let mut responses = Vec::new();
        for single in request.into_inner().requests {
            let digest = single.digest.unwrap_or_default();
            state.blobs.insert(digest.hash.clone(), single.data);
            responses.push(remexec::batch_update_blobs_response::Response {
                digest: Some(digest),
                status: Some(protos::gen::google::rpc::Status::default()),
            });
        }
        Ok(Response::new(remexec::BatchUpdateBlobsResponse {
            responses,
        }))
    }

    async fn batch_read_blobs(
        &self,
        request: Request<remexec::BatchReadBlobsRequest>,
    ) -> Result<Response<remexec::BatchReadBlobsResponse>, Status> {
        self.count("BatchReadBlobs");
        if self.cas_always_errors {
            return Err(Status::unavailable("injected CAS failure"));
        }
        let state = self.state.lock();
        let responses = request
            .into_inner()
            .digests
            .into_iter()
            .map(|digest| match state.blobs.get(&digest.hash) {
                Some(data) => remexec::batch_read_blobs_response::Response {
                    digest: Some(digest),
                    data: data.clone(),
                    compressor: remexec::compressor::Value::Identity as i32,
                    status: Some(protos::gen::google::rpc::Status::default()),
                },
                None => remexec::batch_read_blobs_response::Response {
                    digest: Some(digest),
                    data: Bytes::new(),
                    compressor: remexec::compressor::Value::Identity as i32,
                    status: Some(protos::gen::google::rpc::Status {
                        code: Code::NotFound as i32,
                        message: "blob not found".to_string(),
                        details: vec![],
                    }),
                },
            })
            .collect();
        Ok(Response::new(remexec::BatchReadBlobsResponse { responses }))
    }

    type GetTreeStream = futures::stream::BoxStream<'static, Result<remexec::GetTreeResponse, Status>>;

    async fn get_tree(
        &self,
        _request: Request<remexec::GetTreeRequest>,
    ) -> Result<Response<Self::GetTreeStream>, Status> {
        Err(Status::unimplemented("GetTree is not stubbed"))
    }
}

#[tonic::async_trait]
impl ByteStream for Shared {
    type ReadStream = futures::stream::BoxStream<'static, Result<ReadResponse, Status>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        self.count("ByteStream.Read");
        if self.cas_always_errors {
            return Err(Status::unavailable("injected CAS failure"));
        }
        let request = request.into_inner();
        let hash = parse_read_resource(&request.resource_name)?;
        let data = self
            .state
            .lock()
            .blobs
            .get(&hash)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no blob {hash}")))?;

        let offset = request.read_offset.max(0) as usize;
        if offset > data.len() {
            return Err(Status::out_of_range("read_offset beyond blob size"));
        }
        let data = data.slice(offset..);
        let stream = async_stream::stream! {
            // Chunked like a real server, so clients exercise multi-message reads.
            const CHUNK: usize = 64 * 1024;
            let mut position = 0;
            if data.is_empty() {
                yield Ok(ReadResponse { data: Bytes::new() });
            }
            while position < data.len() {
                let end = (position + CHUNK).min(data.len());
                yield Ok(ReadResponse { data: data.slice(position..end) });
                position = end;
            }
        };
        Ok(Response::new(stream.boxed()))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        self.count("ByteStream.Write");
        if self.cas_always_errors {
            return Err(Status::unavailable("injected CAS failure"));
        }
        let mut stream = request.into_inner();
        let mut resource_name = String::new();
        let mut finished = false;

        while let Some(message) = stream.message().await? {
            if resource_name.is_empty() {
                resource_name = message.resource_name.clone();
                let committed = self
                    .state
                    .lock()
                    .partial_writes
                    .get(&resource_name)
                    .map(|buffer| buffer.len() as i64)
                    .unwrap_or(0);
                if message.write_offset != committed {
                    return Err(Status::invalid_argument(format!(
                        "write_offset {} does not match committed size {committed}",
                        message.write_offset
                    )));
                }
            }

            let interrupted = {
                let mut state = self.state.lock();
                let buffer = state
                    .partial_writes
                    .entry(resource_name.clone())
                    .or_default();
                buffer.extend_from_slice(&message.data);
                let committed = buffer.len();
                if state.writes_to_interrupt > 0 && committed >= self.write_fail_after_bytes {
                    state.writes_to_interrupt -= 1;
                    true
                } else {
                    false
                }
            };
            if interrupted {
                return Err(Status::unavailable("injected write interruption"));
            }
            if message.finish_write {
                finished = true;
                break;
            }
        }

        if !finished {
            return Err(Status::invalid_argument("write ended without finish_write"));
        }

        let mut state = self.state.lock();
        let buffer = state
            .partial_writes
            .remove(&resource_name)
            .unwrap_or_default();
        let committed = buffer.len() as i64;
        let hash = parse_write_resource(&resource_name)?;
        state.blobs.insert(hash, Bytes::from(buffer));
        state
            .completed_writes
            .insert(resource_name, committed);
        Ok(Response::new(WriteResponse {
            committed_size: committed,
        }))
    }

    async fn query_write_status(
        &self,
        request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        self.count("QueryWriteStatus");
        let resource_name = request.into_inner().resource_name;
        let state = self.state.lock();
        if let Some(committed) = state.completed_writes.get(&resource_name) {
            return Ok(Response::new(QueryWriteStatusResponse {
                committed_size: *committed,
                complete: true,
            }));
        }
        let committed = state
            .partial_writes
            .get(&resource_name)
            .map(|buffer| buffer.len() as i64)
            .unwrap_or(0);
        Ok(Response::new(QueryWriteStatusResponse {
            committed_size: committed,
            complete: false,
        }))
    }
}

#[tonic::async_trait]
impl ActionCache for Shared {
    async fn get_action_result(
        &self,
        request: Request<remexec::GetActionResultRequest>,
    ) -> Result<Response<remexec::ActionResult>, Status> {
        self.count("GetActionResult");
        if self.cas_always_errors {
            return Err(Status::unavailable("injected AC failure"));
        }
        let digest = request.into_inner().action_digest.unwrap_or_default();
        self.state
            .lock()
            .action_results
            .get(&digest.hash)
            .cloned()
            .map(Response::new)
            .ok_or_else(|| Status::not_found("no cached result"))
    }

    async fn update_action_result(
        &self,
        request: Request<remexec::UpdateActionResultRequest>,
    ) -> Result<Response<remexec::ActionResult>, Status> {
        self.count("UpdateActionResult");
        if self.cas_always_errors {
            return Err(Status::unavailable("injected AC failure"));
        }
        let request = request.into_inner();
        let digest = request.action_digest.unwrap_or_default();
        let result = request
            .action_result
            .ok_or_else(|| Status::invalid_argument("missing action_result"))?;
        self.state
            .lock()
            .action_results
            .insert(digest.hash, result.clone());
        Ok(Response::new(result))
    }
}

#[tonic::async_trait]
impl Capabilities for Shared {
    async fn get_capabilities(
        &self,
        _request: Request<remexec::GetCapabilitiesRequest>,
    ) -> Result<Response<remexec::ServerCapabilities>, Status> {
        self.count("GetCapabilities");
        Ok(Response::new(remexec::ServerCapabilities {
            cache_capabilities: Some(remexec::CacheCapabilities {
                max_batch_total_size_bytes: self.batch_cap,
                action_cache_update_capabilities: Some(remexec::ActionCacheUpdateCapabilities {
                    update_enabled: true,
                }),
                ..remexec::CacheCapabilities::default()
            }),
            execution_capabilities: Some(remexec::ExecutionCapabilities {
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

/// `[{instance}/]blobs/{hash}/{size}`
fn parse_read_resource(resource: &str) -> Result<String, Status> {
    let parts: Vec<&str> = resource.split('/').collect();
    parts
        .iter()
        .position(|part| *part == "blobs")
        .and_then(|i| parts.get(i + 1))
        .map(|hash| hash.to_string())
        .ok_or_else(|| Status::invalid_argument(format!("bad read resource: {resource}")))
}

/// `[{instance}/]uploads/{uuid}/blobs/{hash}/{size}`
fn parse_write_resource(resource: &str) -> Result<String, Status> {
    let parts: Vec<&str> = resource.split('/').collect();
    parts
        .iter()
        .position(|part| *part == "blobs")
        .and_then(|i| parts.get(i + 1))
        .map(|hash| hash.to_string())
        .ok_or_else(|| Status::invalid_argument(format!("bad write resource: {resource}")))
}
