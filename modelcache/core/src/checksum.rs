//! Artifact Checksums
//!
//! SHA-256 content digests for artifacts of any size. Hashing always walks the
//! input in fixed-size chunks so the working set stays bounded, whether the
//! input is an in-memory buffer or a multi-gigabyte file on disk.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::CacheResult;

/// Chunk size used for incremental hashing (1 MiB)
pub const HASH_CHUNK_BYTES: usize = 1024 * 1024;

/// Hash algorithm recorded alongside stored digests
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256, lowercase hex
    #[default]
    Sha256,
}

impl ChecksumAlgorithm {
    /// Prefix accepted in front of a digest, e.g. `sha256:abcd...`
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256:",
        }
    }

    /// Length of a hex digest
    #[must_use]
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
        }
    }
}

/// Incremental hasher fed with chunks as they arrive
#[derive(Clone, Default)]
pub struct StreamingHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    /// Create an empty hasher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes hashed so far
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the lowercase hex digest
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Compute the hex digest of an in-memory buffer
#[must_use]
pub fn compute_checksum(bytes: &[u8]) -> String {
    let mut hasher = StreamingHasher::new();
    for chunk in bytes.chunks(HASH_CHUNK_BYTES) {
        hasher.update(chunk);
    }
    hasher.finalize_hex()
}

/// Check a buffer against an expected digest (case-insensitive)
#[must_use]
pub fn verify(bytes: &[u8], expected_hex: &str) -> bool {
    digests_match(&compute_checksum(bytes), expected_hex)
}

/// Compute the hex digest of a file without loading it into memory
///
/// # Errors
///
/// Returns `CacheError::Io` if the file cannot be opened or read.
pub async fn checksum_file(path: &Path) -> CacheResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = StreamingHasher::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize_hex())
}

/// Normalize a caller-supplied digest: trim, drop an algorithm prefix,
/// lowercase
#[must_use]
pub fn normalize_digest(digest: &str) -> String {
    let trimmed = digest.trim();
    let prefix = ChecksumAlgorithm::Sha256.prefix();
    let bare = match trimmed.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => &trimmed[prefix.len()..],
        _ => trimmed,
    };
    bare.to_ascii_lowercase()
}

/// Compare two digests ignoring case and an optional `sha256:` prefix
#[must_use]
pub fn digests_match(actual: &str, expected: &str) -> bool {
    normalize_digest(actual) == normalize_digest(expected)
}
