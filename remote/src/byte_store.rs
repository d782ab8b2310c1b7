// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use lazy_static::lazy_static;
use log::debug;
use tonic::{Code, Request};

use fs::{ObjectInfo, ObjectType};
use grpc_util::retry::{retry_call_grpc, status_is_retryable, RetryConfig};
use grpc_util::{status_ref_to_str, status_to_str, LayeredService};
use hashing::{Digest, HashFunction};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::bytestream::byte_stream_client::ByteStreamClient;
use remexec::content_addressable_storage_client::ContentAddressableStorageClient;

use crate::capabilities::{Capabilities, CapabilitiesCache};
use crate::{connect_layered, RemoteOptions};

lazy_static! {
    // One upload namespace per process: concurrent writers on one machine never collide on a
    // resource name, and a retried write of the same blob resumes its own resource.
    static ref PROCESS_UUID: uuid::Uuid = uuid::Uuid::new_v4();
}

// Estimated per-blob envelope overhead in a batch request.
const BATCH_ENTRY_OVERHEAD: usize = 256;

///
/// A client for the remote content-addressable store: missing-blob queries, batched
/// transfers for small blobs, and resumable byte streams for large ones.
///
pub struct ByteStore {
    instance_name: Option<String>,
    hash_function: HashFunction,
    chunk_size_bytes: usize,
    batch_api_size_limit: usize,
    retry: RetryConfig,
    cas_client: Arc<ContentAddressableStorageClient<LayeredService>>,
    byte_stream_client: Arc<ByteStreamClient<LayeredService>>,
    capabilities: CapabilitiesCache,
}

impl ByteStore {
    pub fn new(options: &RemoteOptions, hash_function: HashFunction) -> Result<ByteStore, String> {
        let channel = connect_layered(options)?;
        let cas_client = Arc::new(ContentAddressableStorageClient::new(channel.clone()));
        let byte_stream_client = Arc::new(ByteStreamClient::new(channel.clone()));
        let capabilities = CapabilitiesCache::new(
            channel,
            options.instance_name.clone(),
            hash_function,
            options.capabilities_cell_opt.clone(),
            options.retry,
        );
        Ok(ByteStore {
            instance_name: options.instance_name.clone(),
            hash_function,
            chunk_size_bytes: options.chunk_size_bytes,
            batch_api_size_limit: options.batch_api_size_limit,
            retry: options.retry,
            cas_client,
            byte_stream_client,
            capabilities,
        })
    }

    fn instance_prefix(&self) -> String {
        match &self.instance_name {
            Some(name) if !name.is_empty() => format!("{name}/"),
            _ => String::new(),
        }
    }

    async fn capabilities(&self) -> Result<Capabilities, String> {
        self.capabilities.get().await
    }

    /// The effective per-batch byte budget against this endpoint.
    async fn batch_size_limit(&self) -> Result<usize, String> {
        let server_cap = self.capabilities().await?.max_batch_total_size_bytes;
        Ok(if server_cap == 0 {
            self.batch_api_size_limit
        } else {
            self.batch_api_size_limit.min(server_cap)
        })
    }

    ///
    /// The subset of `digests` the endpoint does not have. Consulted before every upload to
    /// avoid redundant transfer.
    ///
    pub async fn find_missing_digests(
        &self,
        digests: impl IntoIterator<Item = Digest>,
    ) -> Result<HashSet<Digest>, String> {
        let request = remexec::FindMissingBlobsRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            blob_digests: digests.into_iter().map(|d| d.into()).collect(),
        };
        if request.blob_digests.is_empty() {
            return Ok(HashSet::new());
        }

        let response = retry_call_grpc(self.retry, "FindMissingBlobs", |_| {
            let mut client = self.cas_client.as_ref().clone();
            let request = request.clone();
            async move { client.find_missing_blobs(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?;

        response
            .into_inner()
            .missing_blob_digests
            .iter()
            .map(|digest| digest.try_into())
            .collect::<Result<HashSet<_>, _>>()
    }

    ///
    /// Upload blobs, packing small ones greedily into batch requests up to the negotiated cap
    /// and streaming the rest. With `skip_find_missing` the missing set is taken to be all of
    /// `blobs` (used when the caller has just computed it).
    ///
    pub async fn store_blobs(
        &self,
        blobs: Vec<(Digest, Bytes)>,
        skip_find_missing: bool,
    ) -> Result<(), String> {
        let blobs = if skip_find_missing {
            blobs
        } else {
            let missing = self
                .find_missing_digests(blobs.iter().map(|(digest, _)| *digest))
                .await?;
            blobs
                .into_iter()
                .filter(|(digest, _)| missing.contains(digest))
                .collect()
        };
        if blobs.is_empty() {
            return Ok(());
        }

        let limit = self.batch_size_limit().await?;
        let mut batch: Vec<(Digest, Bytes)> = Vec::new();
        let mut batch_bytes = 0_usize;
        for (digest, bytes) in blobs {
            let entry_bytes = bytes.len() + BATCH_ENTRY_OVERHEAD;
            if entry_bytes > limit {
                self.store_via_stream(digest, bytes).await?;
            } else {
                if batch_bytes + entry_bytes > limit {
                    self.store_batch(std::mem::take(&mut batch)).await?;
                    batch_bytes = 0;
                }
                batch_bytes += entry_bytes;
                batch.push((digest, bytes));
            }
        }
        if !batch.is_empty() {
            self.store_batch(batch).await?;
        }
        Ok(())
    }

    /// Upload one blob, choosing batch or stream by size.
    pub async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        let limit = self.batch_size_limit().await?;
        if bytes.len() + BATCH_ENTRY_OVERHEAD > limit {
            self.store_via_stream(digest, bytes).await
        } else {
            self.store_batch(vec![(digest, bytes)]).await
        }
    }

    async fn store_batch(&self, blobs: Vec<(Digest, Bytes)>) -> Result<(), String> {
        let request = remexec::BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            requests: blobs
                .iter()
                .map(|(digest, bytes)| remexec::batch_update_blobs_request::Request {
                    digest: Some((*digest).into()),
                    data: bytes.clone(),
                    compressor: remexec::compressor::Value::Identity as i32,
                })
                .collect(),
        };

        let response = retry_call_grpc(self.retry, "BatchUpdateBlobs", |_| {
            let mut client = self.cas_client.as_ref().clone();
            let request = request.clone();
            async move { client.batch_update_blobs(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?;

        for single in response.into_inner().responses {
            let status = single.status.unwrap_or_default();
            if status.code != Code::Ok as i32 {
                return Err(format!(
                    "Upload of {:?} was rejected: {} {}",
                    single.digest, status.code, status.message
                ));
            }
        }
        Ok(())
    }

    ///
    /// Upload one blob through the byte stream in fixed-size chunks. The write is resumable:
    /// on a transport failure the committed offset is queried via `QueryWriteStatus` and the
    /// stream restarts from there, within the configured attempt bound.
    ///
    async fn store_via_stream(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        let resource_name = format!(
            "{}uploads/{}/blobs/{}/{}",
            self.instance_prefix(),
            *PROCESS_UUID,
            digest.hash,
            digest.size_bytes,
        );

        let attempts = self.retry.max_attempts();
        let mut committed: usize = 0;
        let mut attempt = 1;
        loop {
            match self
                .write_stream_from(&resource_name, &bytes, committed)
                .await
            {
                Ok(total) if total == bytes.len() as i64 => return Ok(()),
                Ok(total) => {
                    return Err(format!(
                        "Uploading blob {digest:?}: want committed size {} but got {total}",
                        bytes.len()
                    ))
                }
                Err(status) if status_is_retryable(&status) && attempt < attempts => {
                    debug!(
                        "ByteStream write of {digest:?} interrupted ({}); querying committed offset",
                        status_ref_to_str(&status)
                    );
                    let write_status = self.query_write_status(&resource_name).await?;
                    if write_status.complete {
                        return Ok(());
                    }
                    committed = write_status.committed_size.max(0) as usize;
                    tokio::time::sleep(self.retry.sleep_time(attempt)).await;
                    attempt += 1;
                }
                Err(status) => return Err(status_to_str(status)),
            }
        }
    }

    /// One streaming write pass from `offset`; returns the committed size reported.
    async fn write_stream_from(
        &self,
        resource_name: &str,
        bytes: &Bytes,
        offset: usize,
    ) -> Result<i64, tonic::Status> {
        let resource_name = resource_name.to_owned();
        let bytes = bytes.clone();
        let chunk_size_bytes = self.chunk_size_bytes;
        let stream = async_stream::stream! {
            if bytes.len() == offset {
                // Nothing left to send (or the blob is empty), but the write must still be
                // finalized with one request.
                yield protos::gen::google::bytestream::WriteRequest {
                    resource_name: resource_name.clone(),
                    write_offset: offset as i64,
                    finish_write: true,
                    data: Bytes::new(),
                };
                return;
            }
            let mut position = offset;
            while position < bytes.len() {
                let end = (position + chunk_size_bytes).min(bytes.len());
                yield protos::gen::google::bytestream::WriteRequest {
                    resource_name: resource_name.clone(),
                    write_offset: position as i64,
                    finish_write: end == bytes.len(),
                    data: bytes.slice(position..end),
                };
                position = end;
            }
        };

        let mut client = self.byte_stream_client.as_ref().clone();
        let response = client.write(Request::new(stream)).await?;
        Ok(response.into_inner().committed_size)
    }

    async fn query_write_status(
        &self,
        resource_name: &str,
    ) -> Result<protos::gen::google::bytestream::QueryWriteStatusResponse, String> {
        let request = protos::gen::google::bytestream::QueryWriteStatusRequest {
            resource_name: resource_name.to_owned(),
        };
        let response = retry_call_grpc(self.retry, "QueryWriteStatus", |_| {
            let mut client = self.byte_stream_client.as_ref().clone();
            let request = request.clone();
            async move { client.query_write_status(Request::new(request)).await }
        })
        .await;
        match response {
            Ok(response) => Ok(response.into_inner()),
            // A server that dropped the partial write reports NOT_FOUND: restart from zero.
            Err(status) if status.code() == Code::NotFound => Ok(
                protos::gen::google::bytestream::QueryWriteStatusResponse::default(),
            ),
            Err(status) => Err(status_to_str(status)),
        }
    }

    ///
    /// Download one object, verifying its digest with the framing appropriate to its type.
    /// Returns None when the endpoint does not have it. Size-unknown digests are read to the
    /// end and verified against the received length.
    ///
    pub async fn load_object(&self, info: &ObjectInfo) -> Result<Option<Bytes>, String> {
        let limit = self.batch_size_limit().await?;
        let data = if info.digest.size_bytes > 0 && info.digest.size_bytes < limit {
            self.load_batch(info.digest).await?
        } else {
            self.load_via_stream(info.digest).await?
        };
        let Some(data) = data else {
            return Ok(None);
        };
        self.verify_content(info, &data)?;
        Ok(Some(data))
    }

    fn verify_content(&self, info: &ObjectInfo, data: &Bytes) -> Result<(), String> {
        let actual = match info.object_type {
            ObjectType::Tree => self.hash_function.hash_tree(data),
            _ => self.hash_function.hash_blob(data),
        };
        if actual.hash != info.digest.hash {
            return Err(format!(
                "Remote CAS returned wrong content for {info}: got digest {:?}",
                actual
            ));
        }
        Ok(())
    }

    async fn load_batch(&self, digest: Digest) -> Result<Option<Bytes>, String> {
        let request = remexec::BatchReadBlobsRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            digests: vec![digest.into()],
            acceptable_compressors: vec![remexec::compressor::Value::Identity as i32],
        };
        let response = retry_call_grpc(self.retry, "BatchReadBlobs", |_| {
            let mut client = self.cas_client.as_ref().clone();
            let request = request.clone();
            async move { client.batch_read_blobs(Request::new(request)).await }
        })
        .await
        .map_err(status_to_str)?;

        let single = response
            .into_inner()
            .responses
            .into_iter()
            .next()
            .ok_or("BatchReadBlobs returned no response for a one-blob request")?;
        let status = single.status.unwrap_or_default();
        if status.code == Code::NotFound as i32 {
            return Ok(None);
        }
        if status.code != Code::Ok as i32 {
            return Err(format!(
                "BatchReadBlobs of {digest:?} failed: {} {}",
                status.code, status.message
            ));
        }
        Ok(Some(single.data))
    }

    async fn load_via_stream(&self, digest: Digest) -> Result<Option<Bytes>, String> {
        let resource_name = format!(
            "{}blobs/{}/{}",
            self.instance_prefix(),
            digest.hash,
            digest.size_bytes
        );
        let request = protos::gen::google::bytestream::ReadRequest {
            resource_name,
            read_offset: 0,
            // 0 means no limit.
            read_limit: 0,
        };

        let result = retry_call_grpc(self.retry, "ByteStream.Read", |_| {
            let mut client = self.byte_stream_client.as_ref().clone();
            let request = request.clone();
            async move {
                // The whole read restarts on failure, so the buffer is per-attempt.
                let mut buffer = Vec::new();
                let response = client.read(Request::new(request)).await?;
                let mut stream = response.into_inner();
                while let Some(message) = stream.next().await {
                    buffer.extend_from_slice(&message?.data);
                }
                Ok(Bytes::from(buffer))
            }
        })
        .await;

        match result {
            Ok(data) => Ok(Some(data)),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status_to_str(status)),
        }
    }

    ///
    /// Download many objects, batching the size-known small ones and streaming the rest.
    /// Missing objects are absent from the result rather than an error.
    ///
    pub async fn load_objects(
        &self,
        infos: &[ObjectInfo],
    ) -> Result<HashMap<Digest, Bytes>, String> {
        let mut result = HashMap::new();
        for info in infos {
            if let Some(data) = self.load_object(info).await? {
                result.insert(info.digest, data);
            }
        }
        Ok(result)
    }
}
