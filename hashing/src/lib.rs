// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

use serde::de::{MapAccess, Visitor};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::{Deserialize, Deserializer};
use sha1::Digest as Sha1Digest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Width of a git-SHA1 fingerprint in bytes.
pub const SHA1_FINGERPRINT_SIZE: usize = 20;
/// Width of a SHA256 fingerprint in bytes.
pub const SHA256_FINGERPRINT_SIZE: usize = 32;
/// The widest fingerprint we store inline.
pub const MAX_FINGERPRINT_SIZE: usize = SHA256_FINGERPRINT_SIZE;

/// Chunk size for streaming file hashing: files are never loaded whole.
const FILE_HASH_CHUNK_SIZE: usize = 4096;

///
/// A fingerprint of either width, stored inline. Two fingerprints are equal only if they were
/// produced by the same hash function (the widths differ) and have identical bytes.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint {
    bytes: [u8; MAX_FINGERPRINT_SIZE],
    len: usize,
}

impl Fingerprint {
    pub fn from_bytes(bytes: &[u8]) -> Result<Fingerprint, String> {
        if bytes.len() != SHA1_FINGERPRINT_SIZE && bytes.len() != SHA256_FINGERPRINT_SIZE {
            return Err(format!(
                "Input value was not a fingerprint; had length: {}",
                bytes.len()
            ));
        }
        let mut fingerprint = [0; MAX_FINGERPRINT_SIZE];
        fingerprint[..bytes.len()].clone_from_slice(bytes);
        Ok(Fingerprint {
            bytes: fingerprint,
            len: bytes.len(),
        })
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        let raw = hex::decode(hex_string).map_err(|e| format!("{e:?}"))?;
        Fingerprint::from_bytes(&raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FingerprintVisitor;

        impl<'de> Visitor<'de> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> Result<(), fmt::Error> {
                formatter.write_str("struct Fingerprint")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Fingerprint::from_hex_string(v).map_err(|err| {
                    serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(&format!("{v:?}: {err}")),
                        &"a hex representation of a 20 or 32 byte value",
                    )
                })
            }
        }

        deserializer.deserialize_string(FingerprintVisitor)
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl TryFrom<&str> for Fingerprint {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Fingerprint::from_hex_string(s)
    }
}

///
/// A Digest is a fingerprint, as well as the size in bytes of the plaintext for which that is the
/// fingerprint.
///
/// It is equivalent to a Remote Execution API Digest, but without the overhead (and awkward API)
/// of needing to create an entire protobuf to pass around the two fields.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut obj = serializer.serialize_struct("digest", 2)?;
        obj.serialize_field("fingerprint", &self.hash)?;
        obj.serialize_field("size_bytes", &self.size_bytes)?;
        obj.end()
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum Field {
    Fingerprint,
    SizeBytes,
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DigestVisitor;

        impl<'de> Visitor<'de> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("struct digest")
            }

            fn visit_map<V>(self, mut map: V) -> Result<Digest, V::Error>
            where
                V: MapAccess<'de>,
            {
                use serde::de;

                let mut fingerprint = None;
                let mut size_bytes = None;
                while let Some(key) = map.next_key()? {
                    match key {
                        Field::Fingerprint => {
                            if fingerprint.is_some() {
                                return Err(de::Error::duplicate_field("fingerprint"));
                            }
                            fingerprint = Some(map.next_value()?);
                        }
                        Field::SizeBytes => {
                            if size_bytes.is_some() {
                                return Err(de::Error::duplicate_field("size_bytes"));
                            }
                            size_bytes = Some(map.next_value()?);
                        }
                    }
                }
                let fingerprint =
                    fingerprint.ok_or_else(|| de::Error::missing_field("fingerprint"))?;
                let size_bytes =
                    size_bytes.ok_or_else(|| de::Error::missing_field("size_bytes"))?;
                Ok(Digest::new(fingerprint, size_bytes))
            }
        }

        const FIELDS: &[&str] = &["fingerprint", "size_bytes"];
        deserializer.deserialize_struct("digest", FIELDS, DigestVisitor)
    }
}

///
/// The hash function of one build invocation. Chosen once at startup and immutable afterwards:
/// every digest produced or consumed by the invocation uses the same function.
///
/// `Native` fingerprints objects the way git does, prefixing the payload with a `blob`/`tree`
/// header, so that source trees already fingerprinted by git can be reused without rehashing.
/// `Compatible` produces plain SHA256 digests as expected by vanilla Remote Execution API
/// endpoints.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashFunction {
    Native,
    Compatible,
}

impl HashFunction {
    pub fn fingerprint_size(&self) -> usize {
        match self {
            HashFunction::Native => SHA1_FINGERPRINT_SIZE,
            HashFunction::Compatible => SHA256_FINGERPRINT_SIZE,
        }
    }

    /// The digest function name used on the wire.
    pub fn digest_function_name(&self) -> &'static str {
        match self {
            HashFunction::Native => "SHA1",
            HashFunction::Compatible => "SHA256",
        }
    }

    /// An incremental hasher with no payload framing.
    pub fn plain_hasher(&self) -> Hasher {
        match self {
            HashFunction::Native => Hasher::new_sha1(),
            HashFunction::Compatible => Hasher::new_sha256(),
        }
    }

    /// An incremental hasher for a blob of known size. In native mode the git `blob` header is
    /// already folded in.
    pub fn blob_hasher(&self, size_bytes: u64) -> Hasher {
        let mut hasher = self.plain_hasher();
        if let HashFunction::Native = self {
            hasher.update(format!("blob {size_bytes}\0").as_bytes());
        }
        hasher
    }

    /// An incremental hasher for a tree payload of known size. In native mode the git `tree`
    /// header is already folded in; in compatible mode tree payloads are hashed plain and MUST
    /// NOT be re-prefixed.
    pub fn tree_hasher(&self, size_bytes: u64) -> Hasher {
        let mut hasher = self.plain_hasher();
        if let HashFunction::Native = self {
            hasher.update(format!("tree {size_bytes}\0").as_bytes());
        }
        hasher
    }

    /// Fingerprint raw data without any framing, in both modes.
    pub fn hash_data(&self, bytes: &[u8]) -> Digest {
        let mut hasher = self.plain_hasher();
        hasher.update(bytes);
        hasher.finish_digest(bytes.len())
    }

    /// Fingerprint the content of a blob object.
    pub fn hash_blob(&self, bytes: &[u8]) -> Digest {
        let mut hasher = self.blob_hasher(bytes.len() as u64);
        hasher.update(bytes);
        hasher.finish_digest(bytes.len())
    }

    /// Fingerprint a canonical tree payload.
    pub fn hash_tree(&self, bytes: &[u8]) -> Digest {
        let mut hasher = self.tree_hasher(bytes.len() as u64);
        hasher.update(bytes);
        hasher.finish_digest(bytes.len())
    }

    /// Fingerprint a file by streaming its content in small chunks.
    pub async fn hash_file(&self, path: &Path, as_tree: bool) -> io::Result<Digest> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let mut hasher = if as_tree {
            self.tree_hasher(size)
        } else {
            self.blob_hasher(size)
        };
        let mut chunk = vec![0_u8; FILE_HASH_CHUNK_SIZE];
        loop {
            let count = file.read(&mut chunk).await?;
            if count == 0 {
                break;
            }
            hasher.update(&chunk[..count]);
        }
        Ok(hasher.finish_digest(size as usize))
    }

    pub fn empty_blob_digest(&self) -> Digest {
        self.hash_blob(b"")
    }

    pub fn empty_tree_digest(&self) -> Digest {
        self.hash_tree(b"")
    }
}

///
/// An incremental hasher over one of the two supported algorithms.
///
#[derive(Clone)]
pub enum Hasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Hasher {
    pub fn new_sha1() -> Hasher {
        Hasher::Sha1(sha1::Sha1::new())
    }

    pub fn new_sha256() -> Hasher {
        Hasher::Sha256(sha2::Sha256::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha1(hasher) => hasher.update(bytes),
            Hasher::Sha256(hasher) => hasher.update(bytes),
        }
    }

    pub fn finish(self) -> Fingerprint {
        let raw = match self {
            Hasher::Sha1(hasher) => hasher.finalize().to_vec(),
            Hasher::Sha256(hasher) => hasher.finalize().to_vec(),
        };
        Fingerprint::from_bytes(&raw).expect("hash output has a valid fingerprint width")
    }

    pub fn finish_digest(self, size_bytes: usize) -> Digest {
        Digest::new(self.finish(), size_bytes)
    }
}

///
/// A Write instance that fingerprints all data that passes through it.
///
pub struct WriterHasher<T> {
    hasher: Hasher,
    byte_count: usize,
    inner: T,
}

impl<T> WriterHasher<T> {
    pub fn new(hasher: Hasher, inner: T) -> WriterHasher<T> {
        WriterHasher {
            hasher,
            byte_count: 0,
            inner,
        }
    }

    ///
    /// Returns the result of fingerprinting this stream, and Drops the stream.
    ///
    pub fn finish(self) -> (Digest, T) {
        (self.hasher.finish_digest(self.byte_count), self.inner)
    }
}

impl<W: Write> Write for WriterHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        // Hash the bytes that were successfully written.
        self.hasher.update(&buf[0..written]);
        self.byte_count += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

///
/// Copy the data from reader into writer, fingerprinting the bytes in one pass. The payload is
/// framed as a blob of `expected_size` bytes.
///
pub async fn async_copy_and_hash<R, W>(
    hash_function: HashFunction,
    expected_size: u64,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = hash_function.blob_hasher(expected_size);
    let mut byte_count = 0_usize;
    let mut chunk = vec![0_u8; FILE_HASH_CHUNK_SIZE];
    loop {
        let count = reader.read(&mut chunk).await?;
        if count == 0 {
            break;
        }
        tokio::io::AsyncWriteExt::write_all(writer, &chunk[..count]).await?;
        hasher.update(&chunk[..count]);
        byte_count += count;
    }
    Ok(hasher.finish_digest(byte_count))
}

///
/// Copy from reader to writer and return whether the copied data matches expected_digest.
///
pub async fn async_verified_copy<R, W>(
    hash_function: HashFunction,
    expected_digest: Digest,
    data_is_immutable: bool,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if data_is_immutable {
        // Trust that the data hasn't changed, and only validate its length.
        let copied = tokio::io::copy(reader, writer).await?;
        Ok(copied as usize == expected_digest.size_bytes)
    } else {
        let actual = async_copy_and_hash(
            hash_function,
            expected_digest.size_bytes as u64,
            reader,
            writer,
        )
        .await?;
        Ok(expected_digest == actual)
    }
}

#[cfg(test)]
mod fingerprint_tests;

#[cfg(test)]
mod digest_tests;

#[cfg(test)]
mod hasher_tests;
