// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

///
/// A remote endpoint in `host:port` form.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn parse(address: &str) -> Result<ServerAddress, String> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid address, expected host:port: {address:?}"))?;
        if host.is_empty() {
            return Err(format!("Invalid address, empty host: {address:?}"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("Invalid port in address {address:?}: {e}"))?;
        Ok(ServerAddress {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

///
/// One entry of a dispatch list: actions whose platform properties are a superset of
/// `properties` are sent to `endpoint` instead of the default executor.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchEndpoint {
    pub properties: BTreeMap<String, String>,
    pub endpoint: ServerAddress,
}

///
/// Parse a dispatch file: a JSON array of `[properties_object, "host:port"]` pairs.
///
pub fn parse_dispatch(json: &str) -> Result<Vec<DispatchEndpoint>, String> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| format!("Invalid dispatch file: {e}"))?;
    let entries = value
        .as_array()
        .ok_or_else(|| format!("Dispatch file must be a JSON array, got {value}"))?;

    let mut result = Vec::with_capacity(entries.len());
    for entry in entries {
        let pair = entry
            .as_array()
            .filter(|pair| pair.len() == 2)
            .ok_or_else(|| format!("Dispatch entry must be a pair, got {entry}"))?;
        let properties_object = pair[0]
            .as_object()
            .ok_or_else(|| format!("Dispatch properties must be an object, got {}", pair[0]))?;
        let mut properties = BTreeMap::new();
        for (key, value) in properties_object {
            let value = value
                .as_str()
                .ok_or_else(|| format!("Dispatch property {key:?} must be a string"))?;
            properties.insert(key.clone(), value.to_string());
        }
        let address = pair[1]
            .as_str()
            .ok_or_else(|| format!("Dispatch endpoint must be a string, got {}", pair[1]))?;
        result.push(DispatchEndpoint {
            properties,
            endpoint: ServerAddress::parse(address)?,
        });
    }
    Ok(result)
}

///
/// The endpoint for an action: the first dispatch entry whose properties are a subset of the
/// action's platform properties wins; otherwise the default endpoint stands.
///
pub fn dispatch_endpoint<'a>(
    dispatch: &'a [DispatchEndpoint],
    action_properties: &BTreeMap<String, String>,
) -> Option<&'a ServerAddress> {
    dispatch
        .iter()
        .find(|entry| {
            entry
                .properties
                .iter()
                .all(|(key, value)| action_properties.get(key) == Some(value))
        })
        .map(|entry| &entry.endpoint)
}
