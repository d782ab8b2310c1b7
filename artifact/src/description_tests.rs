// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fs::{ObjectInfo, ObjectType, RelativePath};
use hashing::HashFunction;

use crate::ArtifactDescription;

#[test]
fn canonical_json_is_stable() {
    let description = ArtifactDescription::local(&RelativePath::new("src/main.c").unwrap(), "");
    assert_eq!(
        description.to_json(),
        r#"{"type":"LOCAL","data":{"path":"src/main.c","repository":""}}"#
    );
}

#[test]
fn json_round_trips() {
    let hash_function = HashFunction::Compatible;
    let descriptions = vec![
        ArtifactDescription::local(&RelativePath::new("a/b").unwrap(), "other"),
        ArtifactDescription::known(ObjectInfo::new(
            hash_function.hash_blob(b"known content"),
            ObjectType::Executable,
        )),
        ArtifactDescription::action_output("action-0", &RelativePath::new("out.txt").unwrap()),
        ArtifactDescription::tree("tree-0"),
    ];
    for description in descriptions {
        let parsed = ArtifactDescription::from_json(&description.to_json()).unwrap();
        assert_eq!(parsed, description);
    }
}

#[test]
fn identifiers_depend_on_description_only() {
    let hash_function = HashFunction::Native;
    let first = ArtifactDescription::action_output("a", &RelativePath::new("out").unwrap());
    let second = ArtifactDescription::action_output("a", &RelativePath::new("out").unwrap());
    assert_eq!(first.id(hash_function), second.id(hash_function));

    let other_path = ArtifactDescription::action_output("a", &RelativePath::new("other").unwrap());
    assert_ne!(first.id(hash_function), other_path.id(hash_function));

    let other_action = ArtifactDescription::action_output("b", &RelativePath::new("out").unwrap());
    assert_ne!(first.id(hash_function), other_action.id(hash_function));
}

#[test]
fn tree_artifacts_are_identified_by_their_action() {
    let description = ArtifactDescription::tree("tree-7");
    assert_eq!(description.to_json(), r#"{"type":"TREE","data":{"id":"tree-7"}}"#);
}
