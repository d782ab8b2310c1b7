// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Clients for the Remote Execution API surface: the content-addressable store (batch and
//! byte-stream transfer), the action cache, and the execution service, plus the endpoint
//! address and dispatch-list handling used to pick where an action runs.

pub mod action_cache;
pub mod address;
pub mod byte_store;
pub mod capabilities;
pub mod execution_client;

#[cfg(test)]
mod address_tests;
#[cfg(test)]
mod byte_store_tests;
#[cfg(test)]
mod execution_client_tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_oncecell::OnceCell;
use tonic::metadata::BinaryMetadataValue;
use tonic::Request;

use grpc_util::prost::MessageExt;
use grpc_util::retry::RetryConfig;
use protos::gen::build::bazel::remote::execution::v2 as remexec;

use crate::capabilities::Capabilities;

/// Max size for batch transfers. Strictly below the default gRPC receive limit, leaving room
/// for the enclosing message.
pub const MAX_BATCH_TRANSFER_SIZE: usize = 3 * 1024 * 1024;

/// The default gRPC maximum receive message length.
pub const GRPC_DEFAULT_MAX_RECV_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;

const _: () = assert!(
    MAX_BATCH_TRANSFER_SIZE < GRPC_DEFAULT_MAX_RECV_MESSAGE_LENGTH,
    "max batch transfer size too large"
);

/// Default chunk window for byte-stream transfers.
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 2 * 1024 * 1024;

///
/// Connection parameters shared by the remote clients of one endpoint.
///
#[derive(Clone)]
pub struct RemoteOptions {
    pub address: String,
    pub instance_name: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub tls_config: Option<grpc_util::tls::Config>,
    pub chunk_size_bytes: usize,
    pub batch_api_size_limit: usize,
    pub rpc_concurrency_limit: usize,
    pub retry: RetryConfig,
    /// Shared capabilities cell, when several clients talk to one endpoint.
    pub capabilities_cell_opt: Option<Arc<OnceCell<Capabilities>>>,
}

impl RemoteOptions {
    pub fn new(address: &str) -> RemoteOptions {
        RemoteOptions {
            address: address.to_owned(),
            instance_name: None,
            headers: BTreeMap::new(),
            tls_config: None,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            batch_api_size_limit: MAX_BATCH_TRANSFER_SIZE,
            rpc_concurrency_limit: 128,
            retry: RetryConfig::default(),
            capabilities_cell_opt: None,
        }
    }
}

/// Build the layered channel shared by the clients of one endpoint.
pub fn connect_layered(options: &RemoteOptions) -> Result<grpc_util::LayeredService, String> {
    let mut headers = options.headers.clone();
    let channel = grpc_util::create_endpoint(
        &options.address,
        options.tls_config.as_ref(),
        &mut headers,
    )?;
    let http_headers = grpc_util::headers_to_http_header_map(&headers)?;
    Ok(grpc_util::layered_service(
        channel,
        options.rpc_concurrency_limit,
        http_headers,
    ))
}

/// Apply REAPI request metadata to a request, identifying the tool and the build.
pub fn apply_request_metadata<T>(mut request: Request<T>, invocation_id: &str) -> Request<T> {
    let metadata = remexec::RequestMetadata {
        tool_details: Some(remexec::ToolDetails {
            tool_name: "mason".into(),
            ..remexec::ToolDetails::default()
        }),
        tool_invocation_id: invocation_id.to_string(),
        ..remexec::RequestMetadata::default()
    };

    let md = request.metadata_mut();
    md.insert_bin(
        "build.bazel.remote.execution.v2.requestmetadata-bin",
        BinaryMetadataValue::try_from(metadata.to_bytes()).expect("metadata encodes"),
    );

    request
}
