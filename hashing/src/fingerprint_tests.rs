// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::Fingerprint;

const SHA1_HEX: &str = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";
const SHA256_HEX: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[test]
fn from_hex_string_sha1_width() {
    let fingerprint = Fingerprint::from_hex_string(SHA1_HEX).unwrap();
    assert_eq!(fingerprint.len(), 20);
    assert_eq!(fingerprint.to_hex(), SHA1_HEX);
}

#[test]
fn from_hex_string_sha256_width() {
    let fingerprint = Fingerprint::from_hex_string(SHA256_HEX).unwrap();
    assert_eq!(fingerprint.len(), 32);
    assert_eq!(fingerprint.to_hex(), SHA256_HEX);
}

#[test]
fn from_hex_string_rejects_bad_widths() {
    Fingerprint::from_hex_string("abcd").expect_err("4 hex chars is not a fingerprint");
    Fingerprint::from_hex_string(&"ab".repeat(31)).expect_err("62 hex chars is not a fingerprint");
}

#[test]
fn from_hex_string_rejects_non_hex() {
    Fingerprint::from_hex_string(&"zz".repeat(20)).expect_err("non-hex input must be rejected");
}

#[test]
fn from_bytes_round_trip() {
    let fingerprint = Fingerprint::from_hex_string(SHA1_HEX).unwrap();
    let again = Fingerprint::from_bytes(fingerprint.as_bytes()).unwrap();
    assert_eq!(fingerprint, again);
}

#[test]
fn widths_never_compare_equal() {
    // A SHA1 fingerprint zero-extended to 32 bytes must still differ from a SHA256 fingerprint
    // with the same leading bytes.
    let sha1 = Fingerprint::from_bytes(&[0xab; 20]).unwrap();
    let mut wide = [0_u8; 32];
    wide[..20].copy_from_slice(&[0xab; 20]);
    let sha256 = Fingerprint::from_bytes(&wide).unwrap();
    assert_ne!(sha1, sha256);
}

#[test]
fn display_is_hex() {
    let fingerprint = Fingerprint::from_hex_string(SHA1_HEX).unwrap();
    assert_eq!(format!("{fingerprint}"), SHA1_HEX);
    assert_eq!(format!("{fingerprint:?}"), format!("Fingerprint<{SHA1_HEX}>"));
}
