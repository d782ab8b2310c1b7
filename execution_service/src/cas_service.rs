// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tonic::{Code, Request, Response, Status};

use fs::{directory, ObjectInfo, ObjectType};
use hashing::Digest;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use remexec::content_addressable_storage_server::ContentAddressableStorage;

use crate::ServerState;

pub(crate) struct CasService {
    state: Arc<ServerState>,
}

impl CasService {
    pub(crate) fn new(state: Arc<ServerState>) -> CasService {
        CasService { state }
    }

    fn digest_of(proto: &remexec::Digest) -> Result<Digest, Status> {
        Digest::try_from(proto).map_err(Status::invalid_argument)
    }

    /// Whether an object with this digest is present in any shard.
    fn has(&self, digest: Digest) -> bool {
        let cas = self.state.storage.cas();
        cas.blob_path(digest, false).is_some() || cas.tree_path(digest).is_some()
    }

    fn read_any(&self, digest: Digest) -> Result<Option<Bytes>, Status> {
        let cas = self.state.storage.cas();
        if let Some(bytes) = cas.read_blob(digest).map_err(Status::internal)? {
            return Ok(Some(bytes));
        }
        cas.read_tree(digest).map_err(Status::internal)
    }

    ///
    /// Ingest one uploaded payload; digest mismatches are rejected per blob.
    ///
    pub(crate) fn store_payload(
        state: &ServerState,
        digest: Digest,
        data: &[u8],
    ) -> Result<(), Status> {
        state
            .storage
            .cas()
            .store_verified(digest, data)
            .map_err(Status::invalid_argument)
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for CasService {
    async fn find_missing_blobs(
        &self,
        request: Request<remexec::FindMissingBlobsRequest>,
    ) -> Result<Response<remexec::FindMissingBlobsResponse>, Status> {
        let mut missing = Vec::new();
        for proto in request.into_inner().blob_digests {
            let digest = Self::digest_of(&proto)?;
            if !self.has(digest) {
                missing.push(proto);
            }
        }
        Ok(Response::new(remexec::FindMissingBlobsResponse {
            missing_blob_digests: missing,
        }))
    }

    async fn batch_update_blobs(
        &self,
        request: Request<remexec::BatchUpdateBlobsRequest>,
    ) -> Result<Response<remexec::BatchUpdateBlobsResponse>, Status> {
        let mut responses = Vec::new();
        for single in request.into_inner().requests {
            let digest_proto = single
                .digest
                .ok_or_else(|| Status::invalid_argument("missing digest in batch update"))?;
            let digest = Self::digest_of(&digest_proto)?;
            let status = match Self::store_payload(&self.state, digest, &single.data) {
                Ok(()) => protos::gen::google::rpc::Status::default(),
                Err(status) => protos::gen::google::rpc::Status {
                    code: status.code() as i32,
                    message: status.message().to_string(),
                    details: vec![],
                },
            };
            responses.push(remexec::batch_update_blobs_response::Response {
                digest: Some(digest_proto),
                status: Some(status),
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
        let mut responses = Vec::new();
        for digest_proto in request.into_inner().digests {
            let digest = Self::digest_of(&digest_proto)?;
            let response = match self.read_any(digest)? {
                Some(data) => remexec::batch_read_blobs_response::Response {
                    digest: Some(digest_proto),
                    data,
                    compressor: remexec::compressor::Value::Identity as i32,
                    status: Some(protos::gen::google::rpc::Status::default()),
                },
                None => remexec::batch_read_blobs_response::Response {
                    digest: Some(digest_proto),
                    data: Bytes::new(),
                    compressor: remexec::compressor::Value::Identity as i32,
                    status: Some(protos::gen::google::rpc::Status {
                        code: Code::NotFound as i32,
                        message: format!("Blob not found: {digest:?}"),
                        details: vec![],
                    }),
                },
            };
            responses.push(response);
        }
        Ok(Response::new(remexec::BatchReadBlobsResponse { responses }))
    }

    type GetTreeStream = futures::stream::BoxStream<'static, Result<remexec::GetTreeResponse, Status>>;

    async fn get_tree(
        &self,
        request: Request<remexec::GetTreeRequest>,
    ) -> Result<Response<Self::GetTreeStream>, Status> {
        let root = protos::require_digest(request.into_inner().root_digest.as_ref())
            .map_err(Status::invalid_argument)?;
        let hash_function = self.state.storage.hash_function();

        // Walk the tree breadth-first, collecting every directory payload.
        let mut directories = Vec::new();
        let mut queue: VecDeque<Digest> = [root].into_iter().collect();
        while let Some(digest) = queue.pop_front() {
            let payload = self
                .state
                .storage
                .cas()
                .read_tree(digest)
                .map_err(Status::internal)?
                .ok_or_else(|| Status::not_found(format!("Tree not found: {digest:?}")))?;
            for child in directory::parse_tree_payload(hash_function, &payload)
                .map_err(Status::invalid_argument)?
            {
                if let directory::TreeChild::Object {
                    info: ObjectInfo {
                        digest,
                        object_type: ObjectType::Tree,
                    },
                    ..
                } = child
                {
                    queue.push_back(digest);
                }
            }
            directories.push(directory::decode_directory(digest, &payload).map_err(|e| {
                Status::failed_precondition(format!(
                    "GetTree requires protocol directories: {e}"
                ))
            })?);
        }

        let response = remexec::GetTreeResponse {
            directories,
            next_page_token: String::new(),
        };
        Ok(Response::new(
            futures::stream::iter(vec![Ok(response)]).boxed(),
        ))
    }
}
