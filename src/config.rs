// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The environment surface of the engine: hash-mode selection, remote-execution endpoint and
//! platform properties, TLS material, and the dispatch list. Everything is resolved once at
//! startup into plain data; configuration errors are fatal before any work starts.

use std::collections::BTreeMap;
use std::path::Path;

use grpc_util::tls;
use hashing::HashFunction;
use remote::address::{parse_dispatch, DispatchEndpoint, ServerAddress};

/// The hash function selected by the environment: `COMPATIBLE` (set and not `false`/`0`)
/// selects plain SHA256 digests.
pub fn hash_function_from_env() -> HashFunction {
    match std::env::var("COMPATIBLE") {
        Ok(value) if value != "false" && value != "0" => HashFunction::Compatible,
        _ => HashFunction::Native,
    }
}

///
/// The remote-execution side of a build configuration.
///
#[derive(Clone, Default)]
pub struct RemoteExecutionConfig {
    pub address: Option<ServerAddress>,
    pub platform_properties: BTreeMap<String, String>,
    pub dispatch: Vec<DispatchEndpoint>,
}

impl RemoteExecutionConfig {
    /// Resolve from `REMOTE_EXECUTION_ADDRESS` / `REMOTE_EXECUTION_PROPERTIES` and an
    /// optional dispatch file.
    pub fn from_env(dispatch_file: Option<&Path>) -> Result<RemoteExecutionConfig, String> {
        let address = match std::env::var("REMOTE_EXECUTION_ADDRESS") {
            Ok(value) => Some(ServerAddress::parse(&value)?),
            Err(_) => None,
        };
        let platform_properties = match std::env::var("REMOTE_EXECUTION_PROPERTIES") {
            Ok(value) => parse_platform_properties(&value)?,
            Err(_) => BTreeMap::new(),
        };
        let dispatch = match dispatch_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read dispatch file {path:?}: {e}"))?;
                parse_dispatch(&content)?
            }
            None => Vec::new(),
        };
        Ok(RemoteExecutionConfig {
            address,
            platform_properties,
            dispatch,
        })
    }
}

/// Parse a `key:value;key:value` platform property list.
pub fn parse_platform_properties(raw: &str) -> Result<BTreeMap<String, String>, String> {
    let mut properties = BTreeMap::new();
    for pair in raw.split(';').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| format!("Invalid platform property, expected key:value: {pair:?}"))?;
        properties.insert(key.to_string(), value.to_string());
    }
    Ok(properties)
}

///
/// TLS material resolved from the environment: the variables name files whose PEM content is
/// loaded here. A client certificate and key must be given together.
///
pub fn tls_config_from_env() -> Result<Option<tls::Config>, String> {
    let read = |variable: &str| -> Result<Option<Vec<u8>>, String> {
        match std::env::var(variable) {
            Ok(path) => std::fs::read(&path)
                .map(Some)
                .map_err(|e| format!("Failed to read {variable} file {path:?}: {e}")),
            Err(_) => Ok(None),
        }
    };

    let root_ca_cert = read("TLS_CA_CERT")?;
    let client_cert = read("TLS_CLIENT_CERT")?;
    let client_key = read("TLS_CLIENT_KEY")?;

    let mtls = match (client_cert, client_key) {
        (Some(cert), Some(key)) => Some((cert, key)),
        (None, None) => None,
        _ => {
            return Err(
                "TLS_CLIENT_CERT and TLS_CLIENT_KEY must be provided together".to_string(),
            )
        }
    };

    if root_ca_cert.is_none() && mtls.is_none() {
        return Ok(None);
    }
    tls::Config::new(root_ca_cert, mtls).map(Some)
}

/// The server-side TLS material (PEM contents), when configured.
pub fn server_tls_from_env() -> Result<Option<(Vec<u8>, Vec<u8>)>, String> {
    let cert = std::env::var("TLS_SERVER_CERT").ok();
    let key = std::env::var("TLS_SERVER_KEY").ok();
    match (cert, key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = std::fs::read(&cert_path)
                .map_err(|e| format!("Failed to read TLS_SERVER_CERT file {cert_path:?}: {e}"))?;
            let key = std::fs::read(&key_path)
                .map_err(|e| format!("Failed to read TLS_SERVER_KEY file {key_path:?}: {e}"))?;
            Ok(Some((cert, key)))
        }
        (None, None) => Ok(None),
        _ => Err("TLS_SERVER_CERT and TLS_SERVER_KEY must be provided together".to_string()),
    }
}

///
/// Whether TLS verification applies to git-over-https transfers: the standard
/// `GIT_SSL_NO_VERIFY` opt-out, overridden by a per-repository `http.sslVerify` setting when
/// present.
///
pub fn git_ssl_verify(repository_override: Option<bool>) -> bool {
    match repository_override {
        Some(verify) => verify,
        None => std::env::var_os("GIT_SSL_NO_VERIFY").is_none(),
    }
}
