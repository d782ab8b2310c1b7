// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fs::RelativePath;
use grpc_util::prost::MessageExt;
use hashing::{Digest, HashFunction};
use protos::gen::build::bazel::remote::execution::v2 as remexec;

///
/// A fully resolved, executable action: the command, its environment, the digest of the tree
/// holding every input at its expected path, and the declared outputs. Two actions with the
/// same digest are observationally equivalent.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Action {
    /// Ordered argument vector; the first element is the program.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub input_root_digest: Digest,
    /// Root-relative output paths, sorted.
    pub output_files: Vec<RelativePath>,
    pub output_dirs: Vec<RelativePath>,
    /// Ordered mapping used for executor selection.
    pub platform_properties: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Suppresses action-cache lookup and write.
    pub do_not_cache: bool,
}

/// The canonical form hashed in native mode.
#[derive(Serialize, Deserialize)]
struct NativeActionDescription {
    command: Vec<String>,
    env: BTreeMap<String, String>,
    input: String,
    output_files: Vec<String>,
    output_dirs: Vec<String>,
    platform: BTreeMap<String, String>,
    timeout_ms: u64,
    do_not_cache: bool,
}

impl Action {
    pub fn new(
        input_root_digest: Digest,
        command: Vec<String>,
        mut output_files: Vec<RelativePath>,
        mut output_dirs: Vec<RelativePath>,
        env: BTreeMap<String, String>,
        platform_properties: BTreeMap<String, String>,
        timeout: Duration,
        do_not_cache: bool,
    ) -> Action {
        output_files.sort();
        output_files.dedup();
        output_dirs.sort();
        output_dirs.dedup();
        Action {
            command,
            env,
            input_root_digest,
            output_files,
            output_dirs,
            platform_properties,
            timeout,
            do_not_cache,
        }
    }

    ///
    /// The digest keying this action in the action cache: in native mode the digest of a
    /// stable JSON description, in compatible mode the digest of the protocol `Action`
    /// message (which reaches the command through its own digest).
    ///
    pub fn digest(&self, hash_function: HashFunction) -> Digest {
        match hash_function {
            HashFunction::Native => {
                hash_function.hash_blob(self.native_description().as_bytes())
            }
            HashFunction::Compatible => {
                let (action, _) = self.to_protos(hash_function);
                hash_function.hash_data(&action.to_bytes())
            }
        }
    }

    /// The serialized form uploaded for remote execution, addressable by `digest()`.
    pub fn serialized(&self, hash_function: HashFunction) -> bytes::Bytes {
        match hash_function {
            HashFunction::Native => bytes::Bytes::from(self.native_description()),
            HashFunction::Compatible => {
                let (action, _) = self.to_protos(hash_function);
                action.to_bytes()
            }
        }
    }

    fn native_description(&self) -> String {
        let description = NativeActionDescription {
            command: self.command.clone(),
            env: self.env.clone(),
            input: format!(
                "{}:{}",
                self.input_root_digest.hash, self.input_root_digest.size_bytes
            ),
            output_files: self.output_files.iter().map(|p| p.to_string()).collect(),
            output_dirs: self.output_dirs.iter().map(|p| p.to_string()).collect(),
            platform: self.platform_properties.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
            do_not_cache: self.do_not_cache,
        };
        serde_json::to_string(&description).expect("actions always serialize")
    }

    /// Parse an action back out of its native serialized form.
    pub fn from_native_json(bytes: &[u8]) -> Result<Action, String> {
        let description: NativeActionDescription = serde_json::from_slice(bytes)
            .map_err(|e| format!("Invalid serialized action: {e}"))?;
        let (hex, size) = description
            .input
            .split_once(':')
            .ok_or_else(|| format!("Invalid input root reference: {:?}", description.input))?;
        let input_root_digest = Digest::new(
            hashing::Fingerprint::from_hex_string(hex)?,
            size.parse::<usize>()
                .map_err(|e| format!("Invalid input root size: {e}"))?,
        );
        Ok(Action {
            command: description.command,
            env: description.env,
            input_root_digest,
            output_files: parse_paths(&description.output_files)?,
            output_dirs: parse_paths(&description.output_dirs)?,
            platform_properties: description.platform,
            timeout: Duration::from_millis(description.timeout_ms),
            do_not_cache: description.do_not_cache,
        })
    }

    /// Reassemble an action from its protocol messages.
    pub fn from_protos(
        action: &remexec::Action,
        command: &remexec::Command,
        default_timeout: Duration,
    ) -> Result<Action, String> {
        let input_root_digest = protos::require_digest(action.input_root_digest.as_ref())?;
        let timeout = match &action.timeout {
            Some(proto) => {
                Duration::from_secs(proto.seconds.max(0) as u64)
                    + Duration::from_nanos(proto.nanos.max(0) as u64)
            }
            None => default_timeout,
        };
        let output_files = parse_paths(&command.output_files)?;
        let output_dirs = parse_paths(&command.output_directories)?;
        Ok(Action {
            command: command.arguments.clone(),
            env: command
                .environment_variables
                .iter()
                .map(|variable| (variable.name.clone(), variable.value.clone()))
                .collect(),
            input_root_digest,
            output_files,
            output_dirs,
            platform_properties: command
                .platform
                .as_ref()
                .map(|platform| {
                    platform
                        .properties
                        .iter()
                        .map(|property| (property.name.clone(), property.value.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            timeout,
            do_not_cache: action.do_not_cache,
        })
    }

    pub fn to_command_proto(&self) -> remexec::Command {
        remexec::Command {
            arguments: self.command.clone(),
            environment_variables: self
                .env
                .iter()
                .map(|(name, value)| remexec::command::EnvironmentVariable {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            output_files: self.output_files.iter().map(|p| p.to_string()).collect(),
            output_directories: self.output_dirs.iter().map(|p| p.to_string()).collect(),
            platform: Some(remexec::Platform {
                properties: self
                    .platform_properties
                    .iter()
                    .map(|(name, value)| remexec::platform::Property {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            }),
            ..remexec::Command::default()
        }
    }

    /// The protocol messages of this action, with the command reachable through its digest.
    pub fn to_protos(&self, hash_function: HashFunction) -> (remexec::Action, remexec::Command) {
        let command = self.to_command_proto();
        let command_digest = hash_function.hash_data(&command.to_bytes());
        let action = remexec::Action {
            command_digest: Some(command_digest.into()),
            input_root_digest: Some(self.input_root_digest.into()),
            timeout: Some(prost_types::Duration {
                seconds: self.timeout.as_secs() as i64,
                nanos: self.timeout.subsec_nanos() as i32,
            }),
            do_not_cache: self.do_not_cache,
            ..remexec::Action::default()
        };
        (action, command)
    }
}

fn parse_paths(paths: &[String]) -> Result<Vec<RelativePath>, String> {
    paths.iter().map(RelativePath::new).collect()
}
