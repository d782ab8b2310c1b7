// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Descriptions of the values flowing through the action graph: artifacts (sources, known
//! blobs, action outputs, trees) and the actions that produce them. Descriptions have a
//! canonical JSON form; identifiers are digests of that form and are what the graph
//! deduplicates on.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use fs::{ObjectInfo, RelativePath};
use hashing::HashFunction;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod description_tests;

/// The identifier of an action: assigned by the analysis that produced the graph, unique
/// within one graph.
pub type ActionId = String;

///
/// The stable identifier of an artifact: the digest of its canonical description, in hex.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// The description of one artifact. The canonical JSON of a description is what its identifier
/// is computed over; two descriptions with equal JSON are one artifact.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ArtifactDescription {
    /// A source file, relative to the root of the named repository.
    #[serde(rename = "LOCAL")]
    Local {
        path: RelativePathString,
        repository: String,
    },
    /// Content already present in some CAS; no action required to produce it.
    #[serde(rename = "KNOWN")]
    Known { info: ObjectInfo },
    /// The output of an action at a root-relative path.
    #[serde(rename = "ACTION")]
    Action {
        id: ActionId,
        path: RelativePathString,
    },
    /// A directory artifact grouping other artifacts; `id` names the tree action building it.
    #[serde(rename = "TREE")]
    Tree { id: ActionId },
}

/// A pre-validated relative path in its string form, as embedded in canonical JSON.
pub type RelativePathString = String;

impl ArtifactDescription {
    pub fn local(path: &RelativePath, repository: &str) -> ArtifactDescription {
        ArtifactDescription::Local {
            path: path.to_string(),
            repository: repository.to_string(),
        }
    }

    pub fn known(info: ObjectInfo) -> ArtifactDescription {
        ArtifactDescription::Known { info }
    }

    pub fn action_output(id: &str, path: &RelativePath) -> ArtifactDescription {
        ArtifactDescription::Action {
            id: id.to_string(),
            path: path.to_string(),
        }
    }

    pub fn tree(id: &str) -> ArtifactDescription {
        ArtifactDescription::Tree { id: id.to_string() }
    }

    /// The canonical JSON this description is identified by.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("artifact descriptions always serialize")
    }

    pub fn from_json(json: &str) -> Result<ArtifactDescription, String> {
        serde_json::from_str(json).map_err(|e| format!("Invalid artifact description: {e}"))
    }

    pub fn id(&self, hash_function: HashFunction) -> ArtifactId {
        ArtifactId(hash_function.hash_data(self.to_json().as_bytes()).hash.to_hex())
    }

    /// Whether this artifact is resolvable without running anything.
    pub fn is_known(&self) -> bool {
        matches!(self, ArtifactDescription::Known { .. })
    }
}

///
/// The command-shaped payload of an action: everything the executor needs besides the input
/// artifacts themselves.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    /// Ordered argument vector; the first element is the program.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Root-relative output paths, kept sorted.
    pub output_files: Vec<RelativePath>,
    pub output_dirs: Vec<RelativePath>,
    /// Properties used for executor selection.
    pub execution_properties: BTreeMap<String, String>,
    /// Per-action timeout; the engine default applies when absent.
    pub timeout: Option<Duration>,
    /// Suppresses action-cache lookup and write for this action.
    pub no_cache: bool,
}

impl CommandSpec {
    pub fn new(command: Vec<String>) -> CommandSpec {
        CommandSpec {
            command,
            env: BTreeMap::new(),
            output_files: Vec::new(),
            output_dirs: Vec::new(),
            execution_properties: BTreeMap::new(),
            timeout: None,
            no_cache: false,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActionKind {
    /// Run a command over the staged inputs.
    Command(CommandSpec),
    /// Group the inputs into a directory; no command runs.
    Tree,
}

///
/// The graph-level description of an action: its identifier, its inputs by in-action path, and
/// what to do once the inputs are ready.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionDescription {
    pub id: ActionId,
    pub inputs: BTreeMap<RelativePath, ArtifactDescription>,
    pub kind: ActionKind,
}

impl ActionDescription {
    pub fn new_command(
        id: &str,
        inputs: BTreeMap<RelativePath, ArtifactDescription>,
        spec: CommandSpec,
    ) -> ActionDescription {
        ActionDescription {
            id: id.to_string(),
            inputs,
            kind: ActionKind::Command(spec),
        }
    }

    pub fn new_tree(
        id: &str,
        inputs: BTreeMap<RelativePath, ArtifactDescription>,
    ) -> ActionDescription {
        ActionDescription {
            id: id.to_string(),
            inputs,
            kind: ActionKind::Tree,
        }
    }

    /// The artifacts this action produces, with their descriptions.
    pub fn outputs(&self) -> Vec<(RelativePath, ArtifactDescription)> {
        match &self.kind {
            ActionKind::Command(spec) => spec
                .output_files
                .iter()
                .chain(spec.output_dirs.iter())
                .map(|path| (path.clone(), ArtifactDescription::action_output(&self.id, path)))
                .collect(),
            ActionKind::Tree => vec![(
                RelativePath::empty(),
                ArtifactDescription::tree(&self.id),
            )],
        }
    }
}
