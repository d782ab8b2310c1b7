// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::proxy::matches_no_proxy;

#[test]
fn suffix_matching() {
    assert!(matches_no_proxy("example.com", "example.com", 443));
    assert!(matches_no_proxy("example.com", "cache.example.com", 443));
    assert!(!matches_no_proxy("example.com", "example.org", 443));
    assert!(!matches_no_proxy("cache.example.com", "example.com", 443));
    // Suffixes match on segment boundaries only.
    assert!(!matches_no_proxy("example.com", "badexample.com", 443));
}

#[test]
fn leading_dot_is_ignored() {
    assert!(matches_no_proxy(".example.com", "example.com", 443));
    assert!(matches_no_proxy(".example.com", "cache.example.com", 443));
}

#[test]
fn star_matches_exactly_one_segment() {
    assert!(matches_no_proxy("*.example.com", "cache.example.com", 443));
    assert!(!matches_no_proxy("*.example.com", "example.com", 443));
    // One star, one segment: the host may be deeper, but the starred segment itself is a
    // single label.
    assert!(matches_no_proxy("*.example.com", "a.b.example.com", 443));
    assert!(matches_no_proxy("a.*.example.com", "a.b.example.com", 443));
    assert!(!matches_no_proxy("a.*.example.com", "x.b.example.com", 443));
}

#[test]
fn port_mismatch_never_matches() {
    assert!(matches_no_proxy("example.com:8980", "example.com", 8980));
    assert!(!matches_no_proxy("example.com:8980", "example.com", 8981));
    assert!(matches_no_proxy("example.com", "example.com", 8981));
}

#[test]
fn lists_split_on_commas_and_whitespace() {
    assert!(matches_no_proxy(
        "other.org, example.com",
        "example.com",
        443
    ));
    assert!(matches_no_proxy("other.org example.com", "example.com", 443));
    assert!(!matches_no_proxy("other.org,second.org", "example.com", 443));
    assert!(!matches_no_proxy("", "example.com", 443));
}
