// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_oncecell::OnceCell;
use log::{debug, warn};
use tonic::Request;

use grpc_util::retry::{retry_call_grpc, RetryConfig};
use grpc_util::{status_to_str, LayeredService};
use hashing::HashFunction;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use remexec::capabilities_client::CapabilitiesClient;

use crate::MAX_BATCH_TRANSFER_SIZE;

/// The protocol version this client implements.
pub const API_VERSION: (i32, i32) = (2, 0);

///
/// The negotiated limits of one endpoint, reduced to what the clients consult.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capabilities {
    /// Upper bound for one batch transfer; zero means the server declared no limit.
    pub max_batch_total_size_bytes: usize,
    pub exec_enabled: bool,
    pub cache_update_enabled: bool,
}

impl Capabilities {
    ///
    /// The defaults assumed when the capabilities of an endpoint cannot be fetched: the
    /// smallest documented batch cap, with every optional feature assumed present. Transfers
    /// stay within limits any compliant server accepts; feature use surfaces its own errors.
    ///
    pub fn conservative_defaults() -> Capabilities {
        Capabilities {
            max_batch_total_size_bytes: MAX_BATCH_TRANSFER_SIZE,
            exec_enabled: true,
            cache_update_enabled: true,
        }
    }

    fn from_server(
        server: &remexec::ServerCapabilities,
        hash_function: HashFunction,
    ) -> Result<Capabilities, String> {
        if let (Some(low), Some(high)) = (&server.low_api_version, &server.high_api_version) {
            let (major, minor) = API_VERSION;
            let too_new = low.major > major || (low.major == major && low.minor > minor);
            let too_old = high.major < major;
            if too_new || too_old {
                return Err(format!(
                    "Server supports API versions {}.{} through {}.{}, client implements {major}.{minor}",
                    low.major, low.minor, high.major, high.minor
                ));
            }
        }

        let wanted = match hash_function {
            HashFunction::Native => remexec::digest_function::Value::Sha1,
            HashFunction::Compatible => remexec::digest_function::Value::Sha256,
        };
        if let Some(cache) = &server.cache_capabilities {
            if !cache.digest_functions.is_empty()
                && !cache.digest_functions.contains(&(wanted as i32))
            {
                return Err(format!(
                    "Server does not support digest function {}",
                    hash_function.digest_function_name()
                ));
            }
        }

        Ok(Capabilities {
            max_batch_total_size_bytes: server
                .cache_capabilities
                .as_ref()
                .map(|c| c.max_batch_total_size_bytes as usize)
                .unwrap_or_default(),
            exec_enabled: server
                .execution_capabilities
                .as_ref()
                .map(|c| c.exec_enabled)
                .unwrap_or(true),
            cache_update_enabled: server
                .cache_capabilities
                .as_ref()
                .and_then(|c| c.action_cache_update_capabilities.as_ref())
                .map(|c| c.update_enabled)
                .unwrap_or(true),
        })
    }
}

///
/// Fetches and caches the capabilities of one endpoint. The fetch happens once per endpoint;
/// all clients of the endpoint share the cell.
///
pub struct CapabilitiesCache {
    instance_name: Option<String>,
    hash_function: HashFunction,
    client: CapabilitiesClient<LayeredService>,
    cell: Arc<OnceCell<Capabilities>>,
    retry: RetryConfig,
}

impl CapabilitiesCache {
    pub fn new(
        channel: LayeredService,
        instance_name: Option<String>,
        hash_function: HashFunction,
        cell: Option<Arc<OnceCell<Capabilities>>>,
        retry: RetryConfig,
    ) -> CapabilitiesCache {
        CapabilitiesCache {
            instance_name,
            hash_function,
            client: CapabilitiesClient::new(channel),
            cell: cell.unwrap_or_else(|| Arc::new(OnceCell::new())),
            retry,
        }
    }

    ///
    /// The capabilities of this endpoint. An unreachable capabilities service degrades to
    /// conservative defaults rather than failing the build; a version or digest-function
    /// mismatch is a configuration error and propagates.
    ///
    pub async fn get(&self) -> Result<Capabilities, String> {
        self.cell
            .get_or_try_init(async {
                let request = remexec::GetCapabilitiesRequest {
                    instance_name: self.instance_name.clone().unwrap_or_default(),
                };
                let response = retry_call_grpc(self.retry, "GetCapabilities", |_| {
                    let mut client = self.client.clone();
                    let request = request.clone();
                    async move { client.get_capabilities(Request::new(request)).await }
                })
                .await;

                match response {
                    Ok(response) => {
                        let server = response.into_inner();
                        debug!("Server capabilities: {server:?}");
                        Capabilities::from_server(&server, self.hash_function)
                    }
                    Err(status) => {
                        warn!(
                            "Failed to fetch server capabilities, falling back to conservative defaults: {}",
                            status_to_str(status)
                        );
                        Ok(Capabilities::conservative_defaults())
                    }
                }
            })
            .await
            .map(|capabilities| *capabilities)
    }
}
