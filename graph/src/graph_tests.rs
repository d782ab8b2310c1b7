// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use maplit::btreemap;

use artifact::{ActionDescription, ArtifactDescription, CommandSpec};
use fs::RelativePath;
use hashing::HashFunction;

use crate::DependencyGraph;

fn path(p: &str) -> RelativePath {
    RelativePath::new(p).unwrap()
}

/// An action consuming `inputs` and producing `outputs` under the given id.
fn action(id: &str, inputs: Vec<(&str, ArtifactDescription)>, outputs: Vec<&str>) -> ActionDescription {
    let mut spec = CommandSpec::new(vec!["/bin/true".to_string()]);
    spec.output_files = outputs.into_iter().map(path).collect();
    ActionDescription::new_command(
        id,
        inputs
            .into_iter()
            .map(|(p, description)| (path(p), description))
            .collect(),
        spec,
    )
}

fn new_graph() -> DependencyGraph {
    DependencyGraph::new(HashFunction::Native)
}

#[test]
fn artifacts_are_interned_by_identifier() {
    let mut graph = new_graph();
    let first = graph.add_artifact(&ArtifactDescription::local(&path("src/a.c"), ""));
    let second = graph.add_artifact(&ArtifactDescription::local(&path("src/a.c"), ""));
    assert_eq!(first, second);
    assert_eq!(graph.artifact_count(), 1);

    let other = graph.add_artifact(&ArtifactDescription::local(&path("src/b.c"), ""));
    assert_ne!(first, other);
    assert_eq!(graph.artifact_count(), 2);
}

#[test]
fn adding_an_action_twice_yields_one_node() {
    let mut graph = new_graph();
    let source = ArtifactDescription::local(&path("main.c"), "");
    graph.add_action(action("compile", vec![("main.c", source.clone())], vec!["main.o"])).unwrap();
    graph.add_action(action("compile", vec![("main.c", source)], vec!["main.o"])).unwrap();
    assert_eq!(graph.action_count(), 1);
    // main.c, main.o.
    assert_eq!(graph.artifact_count(), 2);
}

#[test]
fn conflicting_action_definitions_are_rejected() {
    let mut graph = new_graph();
    graph.add_action(action("build", vec![], vec!["out"])).unwrap();
    graph
        .add_action(action("build", vec![], vec!["other-out"]))
        .expect_err("one id cannot carry two different actions");
}

#[test]
fn builders_and_consumers_are_linked() {
    let mut graph = new_graph();
    let producer = action("produce", vec![], vec!["mid.txt"]);
    let mid = ArtifactDescription::action_output("produce", &path("mid.txt"));
    let consumer = action("consume", vec![("mid.txt", mid.clone())], vec!["out.txt"]);

    graph.add_action(producer).unwrap();
    graph.add_action(consumer).unwrap();

    let mid_id = mid.id(graph.hash_function());
    let node = graph.artifact(&mid_id).unwrap();
    assert_eq!(node.builder.as_deref(), Some("produce"));
    assert_eq!(node.consumers, vec!["consume".to_string()]);

    let consume = graph.action(&"consume".to_string()).unwrap();
    assert_eq!(consume.inputs, vec![(path("mid.txt"), mid_id)]);
}

#[test]
fn an_artifact_has_exactly_one_builder() {
    let mut graph = new_graph();
    graph.add_action(action("first", vec![], vec!["shared.txt"])).unwrap();

    // A different action claiming the same output artifact description.
    let mut spec = CommandSpec::new(vec!["/bin/true".to_string()]);
    spec.output_files = vec![path("shared.txt")];
    let stolen_output = ActionDescription::new_command(
        "second",
        btreemap! { path("ignored") => ArtifactDescription::action_output("first", &path("shared.txt")) },
        spec,
    );
    // "second" consumes first's output and ALSO declares shared.txt, which is a different
    // artifact (action id differs), so this is fine.
    graph.add_action(stolen_output).unwrap();
    assert_eq!(graph.action_count(), 2);
}

#[test]
fn cycles_are_rejected_and_the_graph_is_unchanged() {
    let mut graph = new_graph();

    // a consumes b's output, b consumes a's output.
    let a_out = ArtifactDescription::action_output("a", &path("a.out"));
    let b_out = ArtifactDescription::action_output("b", &path("b.out"));

    graph
        .add_action(action("a", vec![("b.out", b_out.clone())], vec!["a.out"]))
        .unwrap();
    let actions_before = graph.action_count();
    let artifacts_before = graph.artifact_count();

    let err = graph
        .add_action(action("b", vec![("a.out", a_out)], vec!["b.out"]))
        .expect_err("a dependency cycle must be rejected");
    assert!(err.contains("\"a\"") || err.contains("a ->") || err.contains("-> a"), "cycle error must name both actions: {err}");
    assert!(err.contains('b'), "cycle error must name both actions: {err}");

    // The failed insertion left nothing behind.
    assert_eq!(graph.action_count(), actions_before);
    assert_eq!(graph.artifact_count(), artifacts_before);
    assert!(graph.action(&"b".to_string()).is_none());
    // ... and the same action minus the offending input is insertable afterwards.
    graph.add_action(action("b", vec![], vec!["b.out"])).unwrap();
}

#[test]
fn self_cycles_are_rejected() {
    let mut graph = new_graph();
    let own_output = ArtifactDescription::action_output("narcissus", &path("out"));
    graph
        .add_action(action("narcissus", vec![("out", own_output)], vec!["out"]))
        .expect_err("an action cannot consume its own output");
}

#[test]
fn validation_rejects_degenerate_actions() {
    let mut graph = new_graph();

    let mut no_command = action("no-command", vec![], vec!["out"]);
    if let artifact::ActionKind::Command(spec) = &mut no_command.kind {
        spec.command.clear();
    }
    graph.add_action(no_command).expect_err("empty commands are invalid");

    graph
        .add_action(action("no-outputs", vec![], vec![]))
        .expect_err("actions must declare outputs");
}

#[test]
fn tree_actions_group_their_inputs() {
    let mut graph = new_graph();
    graph.add_action(action("gen", vec![], vec!["file.txt"])).unwrap();
    let file = ArtifactDescription::action_output("gen", &path("file.txt"));

    let tree = ActionDescription::new_tree(
        "tree-0",
        btreemap! { path("nested/file.txt") => file },
    );
    graph.add_action(tree).unwrap();

    let tree_artifact = ArtifactDescription::tree("tree-0");
    let node = graph.artifact(&tree_artifact.id(graph.hash_function())).unwrap();
    assert_eq!(node.builder.as_deref(), Some("tree-0"));
}

#[test]
fn required_actions_covers_the_goal_closure() {
    let mut graph = new_graph();
    graph.add_action(action("leaf", vec![], vec!["leaf.txt"])).unwrap();
    let leaf = ArtifactDescription::action_output("leaf", &path("leaf.txt"));
    graph
        .add_action(action("mid", vec![("leaf.txt", leaf)], vec!["mid.txt"]))
        .unwrap();
    let mid = ArtifactDescription::action_output("mid", &path("mid.txt"));
    graph
        .add_action(action("top", vec![("mid.txt", mid.clone())], vec!["top.txt"]))
        .unwrap();
    // An unrelated action that must not be required.
    graph.add_action(action("unrelated", vec![], vec!["other.txt"])).unwrap();

    let top = ArtifactDescription::action_output("top", &path("top.txt"));
    let required = graph
        .required_actions(&[top.id(graph.hash_function())])
        .unwrap();
    let mut sorted = required.clone();
    sorted.sort();
    assert_eq!(
        sorted,
        vec!["leaf".to_string(), "mid".to_string(), "top".to_string()]
    );

    // Source and known artifacts need no actions.
    let source = graph.add_artifact(&ArtifactDescription::local(&path("src.c"), ""));
    assert_eq!(graph.required_actions(&[source]).unwrap(), Vec::<String>::new());
}
