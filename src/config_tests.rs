// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use maplit::btreemap;

use crate::config::{git_ssl_verify, parse_platform_properties};

#[test]
fn platform_properties_parse() {
    assert_eq!(
        parse_platform_properties("OS:linux;ARCH:x86_64").unwrap(),
        btreemap! {
            "ARCH".to_string() => "x86_64".to_string(),
            "OS".to_string() => "linux".to_string(),
        }
    );
    assert_eq!(parse_platform_properties("").unwrap(), btreemap! {});
    // Trailing separators are tolerated.
    assert_eq!(
        parse_platform_properties("OS:linux;").unwrap(),
        btreemap! { "OS".to_string() => "linux".to_string() }
    );
    parse_platform_properties("no-colon").expect_err("properties must be key:value");
}

#[test]
fn repository_override_wins_over_environment() {
    assert!(git_ssl_verify(Some(true)));
    assert!(!git_ssl_verify(Some(false)));
}
