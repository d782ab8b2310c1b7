// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The action dependency DAG: artifacts and the actions producing them, interned by their
//! identifiers. Construction validates paths, deduplicates by identifier, and rejects cycles
//! at insertion time, so consumers always traverse a well-formed DAG.

#[cfg(test)]
mod graph_tests;

use std::collections::{HashMap, HashSet};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};

use artifact::{ActionDescription, ActionId, ActionKind, ArtifactDescription, ArtifactId};
use fs::RelativePath;
use hashing::HashFunction;

///
/// An artifact in the graph: its description, the action producing it (absent for source and
/// known artifacts), and the actions consuming it.
///
#[derive(Debug)]
pub struct ArtifactNode {
    pub id: ArtifactId,
    pub description: ArtifactDescription,
    pub builder: Option<ActionId>,
    pub consumers: Vec<ActionId>,
}

///
/// An action in the graph, with its inputs and outputs resolved to artifact identifiers.
/// Both lists are sorted by in-action path.
///
#[derive(Debug)]
pub struct ActionNode {
    pub description: ActionDescription,
    pub inputs: Vec<(RelativePath, ArtifactId)>,
    pub outputs: Vec<(RelativePath, ArtifactId)>,
}

#[derive(Debug)]
enum Node {
    Artifact(ArtifactNode),
    Action(ActionNode),
}

///
/// The dependency DAG of one build invocation.
///
pub struct DependencyGraph {
    graph: StableDiGraph<Node, ()>,
    artifacts: HashMap<ArtifactId, NodeIndex>,
    actions: HashMap<ActionId, NodeIndex>,
    hash_function: HashFunction,
}

impl DependencyGraph {
    pub fn new(hash_function: HashFunction) -> DependencyGraph {
        DependencyGraph {
            graph: StableDiGraph::new(),
            artifacts: HashMap::new(),
            actions: HashMap::new(),
            hash_function,
        }
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash_function
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    ///
    /// Intern an artifact: adding the same description twice yields the same identifier and
    /// node.
    ///
    pub fn add_artifact(&mut self, description: &ArtifactDescription) -> ArtifactId {
        let id = description.id(self.hash_function);
        if !self.artifacts.contains_key(&id) {
            let index = self.graph.add_node(Node::Artifact(ArtifactNode {
                id: id.clone(),
                description: description.clone(),
                builder: None,
                consumers: Vec::new(),
            }));
            self.artifacts.insert(id.clone(), index);
        }
        id
    }

    ///
    /// Add an action and all artifacts it references. Adding an action with an already
    /// present id is a no-op if the description is identical and an error otherwise. An
    /// action whose insertion would close a cycle is rejected, the error names the actions
    /// on the cycle in insertion order, and the graph is left unchanged.
    ///
    pub fn add_action(&mut self, description: ActionDescription) -> Result<ActionId, String> {
        if let Some(existing_index) = self.actions.get(&description.id) {
            let Node::Action(existing) = &self.graph[*existing_index] else {
                unreachable!("action ids map to action nodes");
            };
            if existing.description == description {
                return Ok(description.id);
            }
            return Err(format!(
                "Conflicting definitions for action {:?}",
                description.id
            ));
        }

        Self::validate(&description)?;

        // Track everything this insertion creates, so a detected cycle can be rolled back.
        let mut created_nodes: Vec<NodeIndex> = Vec::new();
        let mut created_artifact_ids: Vec<ArtifactId> = Vec::new();

        let action_index = self.graph.add_node(Node::Action(ActionNode {
            description: description.clone(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }));
        created_nodes.push(action_index);
        self.actions.insert(description.id.clone(), action_index);

        let mut inputs = Vec::new();
        for (path, input_description) in &description.inputs {
            let input_id = input_description.id(self.hash_function);
            let input_index = match self.artifacts.get(&input_id) {
                Some(index) => *index,
                None => {
                    let index = self.graph.add_node(Node::Artifact(ArtifactNode {
                        id: input_id.clone(),
                        description: input_description.clone(),
                        builder: None,
                        consumers: Vec::new(),
                    }));
                    self.artifacts.insert(input_id.clone(), index);
                    created_nodes.push(index);
                    created_artifact_ids.push(input_id.clone());
                    index
                }
            };
            self.graph.add_edge(action_index, input_index, ());
            if let Node::Artifact(node) = &mut self.graph[input_index] {
                node.consumers.push(description.id.clone());
            }
            inputs.push((path.clone(), input_id));
        }

        let mut outputs = Vec::new();
        let mut assigned_builders: Vec<NodeIndex> = Vec::new();
        for (path, output_description) in description.outputs() {
            let output_id = output_description.id(self.hash_function);
            let output_index = match self.artifacts.get(&output_id) {
                Some(index) => *index,
                None => {
                    let index = self.graph.add_node(Node::Artifact(ArtifactNode {
                        id: output_id.clone(),
                        description: output_description.clone(),
                        builder: None,
                        consumers: Vec::new(),
                    }));
                    self.artifacts.insert(output_id.clone(), index);
                    created_nodes.push(index);
                    created_artifact_ids.push(output_id.clone());
                    index
                }
            };
            let existing_builder = match &self.graph[output_index] {
                Node::Artifact(node) => node.builder.clone(),
                Node::Action(_) => unreachable!("artifact ids map to artifact nodes"),
            };
            if let Some(other) = existing_builder {
                let error = format!(
                    "Artifact {output_id} already built by action {other:?}, cannot also be built by {:?}",
                    description.id
                );
                self.rollback(
                    created_nodes,
                    created_artifact_ids,
                    &description.id,
                    assigned_builders,
                );
                return Err(error);
            }
            if let Node::Artifact(node) = &mut self.graph[output_index] {
                node.builder = Some(description.id.clone());
            }
            assigned_builders.push(output_index);
            self.graph.add_edge(output_index, action_index, ());
            outputs.push((path.clone(), output_id));
        }

        inputs.sort_by(|l, r| l.0.cmp(&r.0));
        outputs.sort_by(|l, r| l.0.cmp(&r.0));
        if let Node::Action(node) = &mut self.graph[action_index] {
            node.inputs = inputs;
            node.outputs = outputs;
        }

        if let Some(cycle) = self.find_cycle_through(&description.id) {
            self.rollback(created_nodes, created_artifact_ids, &description.id, assigned_builders);
            return Err(format!(
                "Adding action {:?} would close a dependency cycle: {}",
                description.id,
                cycle.join(" -> ")
            ));
        }

        Ok(description.id)
    }

    fn validate(description: &ActionDescription) -> Result<(), String> {
        if description.id.is_empty() {
            return Err("Action ids must not be empty".to_string());
        }
        if let ActionKind::Command(spec) = &description.kind {
            if spec.command.is_empty() {
                return Err(format!("Action {:?} has an empty command", description.id));
            }
            if spec.output_files.is_empty() && spec.output_dirs.is_empty() {
                return Err(format!("Action {:?} declares no outputs", description.id));
            }
            for path in spec.output_files.iter().chain(spec.output_dirs.iter()) {
                if path.as_os_str().is_empty() {
                    return Err(format!(
                        "Action {:?} declares an empty output path",
                        description.id
                    ));
                }
            }
        }
        for path in description.inputs.keys() {
            if path.as_os_str().is_empty() {
                return Err(format!(
                    "Action {:?} has an input at an empty path",
                    description.id
                ));
            }
        }
        Ok(())
    }

    fn rollback(
        &mut self,
        created_nodes: Vec<NodeIndex>,
        created_artifact_ids: Vec<ArtifactId>,
        action_id: &ActionId,
        assigned_builders: Vec<NodeIndex>,
    ) {
        // Pre-existing artifacts that this action touched get their back-references removed;
        // nodes created by this insertion disappear entirely.
        for index in assigned_builders {
            if let Some(Node::Artifact(node)) = self.graph.node_weight_mut(index) {
                if node.builder.as_ref() == Some(action_id) {
                    node.builder = None;
                }
            }
        }
        for node in self.graph.node_weights_mut() {
            if let Node::Artifact(artifact) = node {
                artifact.consumers.retain(|consumer| consumer != action_id);
            }
        }
        for index in created_nodes {
            self.graph.remove_node(index);
        }
        for id in created_artifact_ids {
            self.artifacts.remove(&id);
        }
        self.actions.remove(action_id);
    }

    ///
    /// A cycle reachable from `start`, as the list of action ids on it in the order they are
    /// traversed, if one exists. Dependencies point from an action through its input
    /// artifacts to their builders.
    ///
    fn find_cycle_through(&self, start: &ActionId) -> Option<Vec<String>> {
        let start_index = *self.actions.get(start)?;
        let mut stack: Vec<(NodeIndex, usize)> = vec![(start_index, 0)];
        let mut path: Vec<NodeIndex> = vec![start_index];
        let mut on_path: HashSet<NodeIndex> = [start_index].into_iter().collect();
        let mut finished: HashSet<NodeIndex> = HashSet::new();

        while let Some((index, child)) = stack.last().copied() {
            let dependencies = self.action_dependencies(index);
            if child >= dependencies.len() {
                stack.pop();
                path.pop();
                on_path.remove(&index);
                finished.insert(index);
                continue;
            }
            stack.last_mut().expect("stack is non-empty").1 += 1;
            let next = dependencies[child];
            if on_path.contains(&next) {
                // Found: report the chain from the first occurrence of `next` onwards.
                let position = path.iter().position(|n| *n == next).expect("on path");
                let mut cycle: Vec<String> = path[position..]
                    .iter()
                    .map(|n| self.action_id_of(*n))
                    .collect();
                cycle.push(self.action_id_of(next));
                return Some(cycle);
            }
            if finished.contains(&next) {
                continue;
            }
            stack.push((next, 0));
            path.push(next);
            on_path.insert(next);
        }
        None
    }

    /// The builder actions of the input artifacts of the action at `index`.
    fn action_dependencies(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let Node::Action(node) = &self.graph[index] else {
            return Vec::new();
        };
        node.inputs
            .iter()
            .filter_map(|(_, artifact_id)| {
                let artifact_index = self.artifacts.get(artifact_id)?;
                let Node::Artifact(artifact) = &self.graph[*artifact_index] else {
                    return None;
                };
                let builder = artifact.builder.as_ref()?;
                self.actions.get(builder).copied()
            })
            .collect()
    }

    fn action_id_of(&self, index: NodeIndex) -> String {
        match &self.graph[index] {
            Node::Action(node) => node.description.id.clone(),
            Node::Artifact(node) => node.id.to_string(),
        }
    }

    pub fn artifact(&self, id: &ArtifactId) -> Option<&ArtifactNode> {
        let index = self.artifacts.get(id)?;
        match &self.graph[*index] {
            Node::Artifact(node) => Some(node),
            Node::Action(_) => None,
        }
    }

    pub fn action(&self, id: &ActionId) -> Option<&ActionNode> {
        let index = self.actions.get(id)?;
        match &self.graph[*index] {
            Node::Action(node) => Some(node),
            Node::Artifact(_) => None,
        }
    }

    pub fn artifact_ids(&self) -> impl Iterator<Item = &ArtifactId> {
        self.artifacts.keys()
    }

    pub fn action_ids(&self) -> impl Iterator<Item = &ActionId> {
        self.actions.keys()
    }

    ///
    /// The set of actions that must run to produce `goals`, i.e. the builders of the goals
    /// and transitively of their inputs.
    ///
    pub fn required_actions(&self, goals: &[ArtifactId]) -> Result<Vec<ActionId>, String> {
        let mut required = Vec::new();
        let mut seen: HashSet<ActionId> = HashSet::new();
        let mut artifact_queue: Vec<&ArtifactId> = Vec::new();
        for goal in goals {
            if self.artifact(goal).is_none() {
                return Err(format!("Unknown artifact requested: {goal}"));
            }
            artifact_queue.push(goal);
        }
        while let Some(artifact_id) = artifact_queue.pop() {
            let artifact = self
                .artifact(artifact_id)
                .ok_or_else(|| format!("Unknown artifact in graph closure: {artifact_id}"))?;
            let Some(builder) = &artifact.builder else {
                continue;
            };
            if !seen.insert(builder.clone()) {
                continue;
            }
            let action = self
                .action(builder)
                .ok_or_else(|| format!("Unknown action in graph closure: {builder:?}"))?;
            required.push(builder.clone());
            for (_, input_id) in &action.inputs {
                artifact_queue.push(input_id);
            }
        }
        Ok(required)
    }
}
