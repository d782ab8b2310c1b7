// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use maplit::btreemap;

use crate::address::{dispatch_endpoint, parse_dispatch, ServerAddress};

#[test]
fn parses_host_and_port() {
    let address = ServerAddress::parse("cache.example.com:8980").unwrap();
    assert_eq!(address.host, "cache.example.com");
    assert_eq!(address.port, 8980);
    assert_eq!(address.to_string(), "cache.example.com:8980");
}

#[test]
fn rejects_malformed_addresses() {
    ServerAddress::parse("no-port").expect_err("missing port must be rejected");
    ServerAddress::parse(":8980").expect_err("empty host must be rejected");
    ServerAddress::parse("host:notaport").expect_err("non-numeric port must be rejected");
    ServerAddress::parse("host:99999").expect_err("out-of-range port must be rejected");
}

#[test]
fn parses_dispatch_file() {
    let dispatch = parse_dispatch(
        r#"[
            [{"OS": "linux", "ARCH": "arm64"}, "arm-runner.example.com:8980"],
            [{"OS": "linux"}, "default-runner.example.com:8980"]
        ]"#,
    )
    .unwrap();
    assert_eq!(dispatch.len(), 2);
    assert_eq!(dispatch[0].endpoint.host, "arm-runner.example.com");
    assert_eq!(
        dispatch[0].properties,
        btreemap! { "ARCH".to_string() => "arm64".to_string(), "OS".to_string() => "linux".to_string() }
    );
}

#[test]
fn rejects_malformed_dispatch_files() {
    parse_dispatch("{}").expect_err("top level must be an array");
    parse_dispatch(r#"[["missing-properties"]]"#).expect_err("entries must be pairs");
    parse_dispatch(r#"[[{"OS": 3}, "host:1"]]"#).expect_err("property values must be strings");
    parse_dispatch(r#"[[{}, "not-an-address"]]"#).expect_err("endpoints must be host:port");
}

#[test]
fn first_subset_match_wins() {
    let dispatch = parse_dispatch(
        r#"[
            [{"OS": "linux", "ARCH": "arm64"}, "arm.example.com:1"],
            [{"OS": "linux"}, "linux.example.com:2"]
        ]"#,
    )
    .unwrap();

    let arm_action = btreemap! {
        "OS".to_string() => "linux".to_string(),
        "ARCH".to_string() => "arm64".to_string(),
        "extra".to_string() => "ignored".to_string(),
    };
    assert_eq!(
        dispatch_endpoint(&dispatch, &arm_action).unwrap().host,
        "arm.example.com"
    );

    let plain_action = btreemap! { "OS".to_string() => "linux".to_string() };
    assert_eq!(
        dispatch_endpoint(&dispatch, &plain_action).unwrap().host,
        "linux.example.com"
    );

    let unmatched = btreemap! { "OS".to_string() => "darwin".to_string() };
    assert_eq!(dispatch_endpoint(&dispatch, &unmatched), None);
}

#[test]
fn empty_properties_match_everything() {
    let dispatch = parse_dispatch(r#"[[{}, "fallback.example.com:1"]]"#).unwrap();
    assert_eq!(
        dispatch_endpoint(&dispatch, &btreemap! {}).unwrap().host,
        "fallback.example.com"
    );
}
