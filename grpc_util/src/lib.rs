// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::iter::FromIterator;
use std::str::FromStr;

use either::Either;
use http::header::{HeaderName, USER_AGENT};
use http::{HeaderMap, HeaderValue};
use itertools::Itertools;
use tonic::transport::{Channel, Endpoint};
use tower::limit::ConcurrencyLimit;
use tower::ServiceBuilder;

use crate::headers::{SetRequestHeaders, SetRequestHeadersLayer};

pub mod headers;
pub mod prost;
pub mod proxy;
pub mod retry;
pub mod tls;

#[cfg(test)]
mod proxy_tests;

// NB: Rather than boxing our tower/tonic services, we define a type alias that fully defines the
// Service layers that we use universally. If this type becomes unwieldy, or our various Services
// diverge in which layers they use, we should instead use a Box<dyn Service<..>>.
pub type LayeredService = SetRequestHeaders<ConcurrencyLimit<Channel>>;

pub fn layered_service(
    channel: Channel,
    concurrency_limit: usize,
    http_headers: HeaderMap,
) -> LayeredService {
    ServiceBuilder::new()
        .layer(SetRequestHeadersLayer::new(http_headers))
        .concurrency_limit(concurrency_limit)
        .service(channel)
}

/// Create a gRPC channel to `addr` (`host:port`, or a full URI with a scheme). Whether TLS is
/// used follows from the presence of `tls_config`.
pub async fn create_channel(
    addr: &str,
    tls_config: Option<&tls::Config>,
) -> Result<Channel, String> {
    let address = if addr.contains("://") {
        addr.to_owned()
    } else if tls_config.is_some() {
        format!("https://{addr}")
    } else {
        format!("http://{addr}")
    };

    let uri = tonic::transport::Uri::try_from(&address)
        .map_err(|err| format!("invalid address: {err}"))?;
    let endpoint = Channel::builder(uri);

    let endpoint = if let Some(tls_config) = tls_config {
        endpoint
            .tls_config(tls_config.to_client_config()?)
            .map_err(|e| format!("TLS setup error: {e}"))?
    } else {
        endpoint
    };

    endpoint
        .connect()
        .await
        .map_err(|err| format!("Failed to connect to {address}: {err}"))
}

/// Like `create_channel`, but lazy: the connection is established on first use, so construction
/// never blocks on an unreachable peer.
pub fn create_endpoint(
    addr: &str,
    tls_config: Option<&tls::Config>,
    headers: &mut BTreeMap<String, String>,
) -> Result<Channel, String> {
    let address = if addr.contains("://") {
        addr.to_owned()
    } else if tls_config.is_some() {
        format!("https://{addr}")
    } else {
        format!("http://{addr}")
    };

    let uri = tonic::transport::Uri::try_from(&address)
        .map_err(|err| format!("invalid address: {err}"))?;
    let endpoint = Channel::builder(uri);

    let endpoint = if let Some(tls_config) = tls_config {
        endpoint
            .tls_config(tls_config.to_client_config()?)
            .map_err(|e| format!("TLS setup error: {e}"))?
    } else {
        endpoint
    };

    let endpoint = apply_user_agent(endpoint, headers)?;

    Ok(endpoint.connect_lazy())
}

fn apply_user_agent(
    endpoint: Endpoint,
    headers: &mut BTreeMap<String, String>,
) -> Result<Endpoint, String> {
    if let Some(user_agent) = headers.remove(USER_AGENT.as_str()) {
        endpoint
            .user_agent(user_agent)
            .map_err(|e| format!("Unable to convert user-agent header: {e}"))
    } else {
        Ok(endpoint)
    }
}

pub fn headers_to_http_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    let (http_headers, errors): (Vec<(HeaderName, HeaderValue)>, Vec<String>) = headers
        .iter()
        .map(|(key, value)| {
            let header_name = HeaderName::from_str(key)
                .map_err(|err| format!("Invalid header name {key}: {err}"))?;

            let header_value = HeaderValue::from_str(value)
                .map_err(|err| format!("Invalid header value {value}: {err}"))?;

            Ok((header_name, header_value))
        })
        .partition_map(|result| match result {
            Ok(v) => Either::Left(v),
            Err(err) => Either::Right(err),
        });

    if !errors.is_empty() {
        return Err(format!("header conversion errors: {}", errors.join("; ")));
    }

    Ok(HeaderMap::from_iter(http_headers))
}

pub fn status_to_str(status: tonic::Status) -> String {
    status_ref_to_str(&status)
}

pub fn status_ref_to_str(status: &tonic::Status) -> String {
    format!("{:?}: {:?}", status.code(), status.message())
}
