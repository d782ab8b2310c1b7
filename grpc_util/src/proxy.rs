// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Matching of `no_proxy`-style exclusion lists against an endpoint address.

/// Whether `host:port` is matched by the exclusion list `no_proxy`: a list of patterns
/// separated by commas or whitespace. A pattern matches when its dot-separated segments are a
/// suffix of the host's, where a leading dot is ignored, `*` matches exactly one segment, and a
/// port given in the pattern must equal the endpoint's port.
pub fn matches_no_proxy(no_proxy: &str, host: &str, port: u16) -> bool {
    no_proxy
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|pattern| !pattern.is_empty())
        .any(|pattern| pattern_matches(pattern, host, port))
}

fn pattern_matches(pattern: &str, host: &str, port: u16) -> bool {
    let (pattern_host, pattern_port) = match pattern.rsplit_once(':') {
        Some((host_part, port_part)) if port_part.chars().all(|c| c.is_ascii_digit()) => {
            match port_part.parse::<u16>() {
                Ok(parsed) => (host_part, Some(parsed)),
                Err(_) => return false,
            }
        }
        _ => (pattern, None),
    };

    if let Some(pattern_port) = pattern_port {
        if pattern_port != port {
            return false;
        }
    }

    let pattern_host = pattern_host.strip_prefix('.').unwrap_or(pattern_host);
    if pattern_host.is_empty() {
        return false;
    }

    let host_segments: Vec<&str> = host.split('.').collect();
    let pattern_segments: Vec<&str> = pattern_host.split('.').collect();
    if pattern_segments.len() > host_segments.len() {
        return false;
    }

    host_segments[host_segments.len() - pattern_segments.len()..]
        .iter()
        .zip(pattern_segments.iter())
        .all(|(host_segment, pattern_segment)| {
            *pattern_segment == "*" || host_segment == pattern_segment
        })
}
