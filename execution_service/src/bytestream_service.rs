// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tonic::{Request, Response, Status, Streaming};

use hashing::Digest;
use protos::gen::google::bytestream::{
    byte_stream_server::ByteStream, QueryWriteStatusRequest, QueryWriteStatusResponse,
    ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};

use crate::cas_service::CasService;
use crate::ServerState;

const READ_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) struct ByteStreamService {
    state: Arc<ServerState>,
}

impl ByteStreamService {
    pub(crate) fn new(state: Arc<ServerState>) -> ByteStreamService {
        ByteStreamService { state }
    }

    /// `[{instance}/]blobs/{hash}/{size}`
    fn parse_read_resource(resource: &str) -> Result<Digest, Status> {
        Self::parse_blob_segments(resource)
    }

    /// `[{instance}/]uploads/{uuid}/blobs/{hash}/{size}`
    fn parse_write_resource(resource: &str) -> Result<Digest, Status> {
        if !resource.split('/').any(|segment| segment == "uploads") {
            return Err(Status::invalid_argument(format!(
                "Invalid write resource name: {resource:?}"
            )));
        }
        Self::parse_blob_segments(resource)
    }

    fn parse_blob_segments(resource: &str) -> Result<Digest, Status> {
        let segments: Vec<&str> = resource.split('/').collect();
        let blobs_at = segments
            .iter()
            .position(|segment| *segment == "blobs")
            .ok_or_else(|| {
                Status::invalid_argument(format!("Invalid resource name: {resource:?}"))
            })?;
        let hash = segments.get(blobs_at + 1).ok_or_else(|| {
            Status::invalid_argument(format!("Resource name missing hash: {resource:?}"))
        })?;
        let size = segments
            .get(blobs_at + 2)
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or_else(|| {
                Status::invalid_argument(format!("Resource name missing size: {resource:?}"))
            })?;
        let fingerprint = hashing::Fingerprint::from_hex_string(hash)
            .map_err(|e| Status::invalid_argument(format!("Bad hash in resource name: {e}")))?;
        Ok(Digest::new(fingerprint, size))
    }

    fn read_any(&self, digest: Digest) -> Result<Option<Bytes>, Status> {
        let cas = self.state.storage.cas();
        if let Some(bytes) = cas.read_blob(digest).map_err(Status::internal)? {
            return Ok(Some(bytes));
        }
        cas.read_tree(digest).map_err(Status::internal)
    }
}

#[tonic::async_trait]
impl ByteStream for ByteStreamService {
    type ReadStream = futures::stream::BoxStream<'static, Result<ReadResponse, Status>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let request = request.into_inner();
        let digest = Self::parse_read_resource(&request.resource_name)?;
        let data = self
            .read_any(digest)?
            .ok_or_else(|| Status::not_found(format!("Blob not found: {digest:?}")))?;

        let offset = request.read_offset.max(0) as usize;
        if offset > data.len() {
            return Err(Status::out_of_range(format!(
                "read_offset {offset} beyond blob size {}",
                data.len()
            )));
        }
        let mut data = data.slice(offset..);
        if request.read_limit > 0 {
            data = data.slice(..data.len().min(request.read_limit as usize));
        }

        let stream = async_stream::stream! {
            if data.is_empty() {
                yield Ok(ReadResponse { data: Bytes::new() });
                return;
            }
            let mut position = 0;
            while position < data.len() {
                let end = (position + READ_CHUNK_SIZE).min(data.len());
                yield Ok(ReadResponse { data: data.slice(position..end) });
                position = end;
            }
        };
        Ok(Response::new(stream.boxed()))
    }

    ///
    /// Resumable writes: partial data is retained under the resource name when a stream
    /// breaks, and a client that queried the committed offset continues from there. The
    /// upload only becomes a CAS object once `finish_write` arrives and the digest checks
    /// out.
    ///
    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let mut stream = request.into_inner();
        let mut resource_name = String::new();
        let mut finished = false;

        loop {
            let message = match stream.message().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(status) => {
                    // The stream broke: keep the partial write for a later resumption.
                    return Err(status);
                }
            };
            if resource_name.is_empty() {
                resource_name = message.resource_name.clone();
                if let Some(committed) = self.state.completed_writes.lock().get(&resource_name) {
                    // The previous attempt completed; nothing left to do.
                    return Ok(Response::new(WriteResponse {
                        committed_size: *committed,
                    }));
                }
                let committed = self
                    .state
                    .partial_writes
                    .lock()
                    .get(&resource_name)
                    .map(|buffer| buffer.len() as i64)
                    .unwrap_or(0);
                if message.write_offset != committed {
                    return Err(Status::failed_precondition(format!(
                        "write_offset {} does not match committed size {committed}",
                        message.write_offset
                    )));
                }
            }

            {
                let mut partial = self.state.partial_writes.lock();
                partial
                    .entry(resource_name.clone())
                    .or_default()
                    .extend_from_slice(&message.data);
            }
            if message.finish_write {
                finished = true;
                break;
            }
        }

        if !finished {
            return Err(Status::cancelled("write ended without finish_write"));
        }

        let digest = Self::parse_write_resource(&resource_name)?;
        let buffer = self
            .state
            .partial_writes
            .lock()
            .remove(&resource_name)
            .unwrap_or_default();
        let committed = buffer.len() as i64;
        CasService::store_payload(&self.state, digest, &buffer)?;
        self.state
            .completed_writes
            .lock()
            .insert(resource_name, committed);
        Ok(Response::new(WriteResponse {
            committed_size: committed,
        }))
    }

    async fn query_write_status(
        &self,
        request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        let resource_name = request.into_inner().resource_name;
        if let Some(committed) = self.state.completed_writes.lock().get(&resource_name) {
            return Ok(Response::new(QueryWriteStatusResponse {
                committed_size: *committed,
                complete: true,
            }));
        }
        let committed = self
            .state
            .partial_writes
            .lock()
            .get(&resource_name)
            .map(|buffer| buffer.len() as i64)
            .unwrap_or(0);
        Ok(Response::new(QueryWriteStatusResponse {
            committed_size: committed,
            complete: false,
        }))
    }
}
