//! Artifact Metadata Types
//!
//! Descriptive records kept next to every durable artifact, plus the key
//! helpers shared by the tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::error::{CacheError, CacheResult};
use crate::format::ArtifactFormat;

/// Artifact payload. Cheap to clone; never mutated once stored.
pub type ArtifactBytes = bytes::Bytes;

/// Descriptive record for a stored artifact
///
/// Only `last_accessed_at` and `access_count` change after the artifact is
/// written; everything else is fixed at `put` time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Logical artifact key, e.g. `whisper-tiny`
    pub key: String,
    /// Human-readable name
    pub display_name: String,
    /// Format the caller says the artifact has
    pub declared_format: ArtifactFormat,
    /// Where the artifact was fetched from
    pub source_url: Option<String>,
    /// Digest the caller expects, hex
    pub expected_checksum: Option<String>,
    /// Size the caller expects
    pub expected_size_bytes: Option<u64>,
    /// Actual stored size (filled in by the store)
    #[serde(default)]
    pub size_bytes: u64,
    /// Digest of the stored bytes (filled in by the store)
    #[serde(default)]
    pub checksum: Option<String>,
    /// Algorithm of `checksum`
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Format detected at write time
    #[serde(default)]
    pub detected_format: ArtifactFormat,
    /// When the artifact was first stored
    pub created_at: DateTime<Utc>,
    /// When the artifact was last read
    pub last_accessed_at: DateTime<Utc>,
    /// Number of successful reads
    pub access_count: u64,
}

impl ArtifactMetadata {
    /// Create metadata for `key` with nothing declared
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let now = Utc::now();
        Self {
            display_name: key.clone(),
            key,
            declared_format: ArtifactFormat::Unknown,
            source_url: None,
            expected_checksum: None,
            expected_size_bytes: None,
            size_bytes: 0,
            checksum: None,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            detected_format: ArtifactFormat::Unknown,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the declared format
    #[must_use]
    pub fn with_format(mut self, format: ArtifactFormat) -> Self {
        self.declared_format = format;
        self
    }

    /// Set the source URL
    #[must_use]
    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    /// Set the expected digest
    #[must_use]
    pub fn with_expected_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }

    /// Set the expected size
    #[must_use]
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size_bytes = Some(size);
        self
    }

    /// Record a successful read
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count = self.access_count.saturating_add(1);
    }
}

/// Reject keys that cannot name an artifact
///
/// # Errors
///
/// Returns `CacheError::InvalidKey` for empty or whitespace-only keys.
pub fn validate_key(key: &str) -> CacheResult<()> {
    if key.trim().is_empty() {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Map a key to a file-name stem
///
/// Plain keys (`[A-Za-z0-9._-]`, not starting with `.`) are used verbatim.
/// Anything else becomes `~` followed by the hex of its UTF-8 bytes; `~`
/// never appears in a verbatim stem, so the two forms cannot collide.
#[must_use]
pub fn file_stem_for_key(key: &str) -> String {
    let plain = !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if plain {
        key.to_string()
    } else {
        format!("~{}", hex::encode(key.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_defaults() {
        let meta = ArtifactMetadata::new("tinyllama-1.1b")
            .with_display_name("TinyLlama 1.1B")
            .with_format(ArtifactFormat::Gguf)
            .with_source_url("https://example.com/model.gguf")
            .with_expected_checksum("abc")
            .with_expected_size(669_000_000);

        assert_eq!(meta.key, "tinyllama-1.1b");
        assert_eq!(meta.display_name, "TinyLlama 1.1B");
        assert_eq!(meta.declared_format, ArtifactFormat::Gguf);
        assert_eq!(meta.expected_size_bytes, Some(669_000_000));
        assert_eq!(meta.access_count, 0);
        assert_eq!(ArtifactMetadata::new("k").display_name, "k");
    }

    #[test]
    fn test_touch_updates_access() {
        let mut meta = ArtifactMetadata::new("k");
        let before = meta.last_accessed_at;
        meta.touch();
        meta.touch();
        assert_eq!(meta.access_count, 2);
        assert!(meta.last_accessed_at >= before);
        assert_eq!(meta.created_at, before);
    }

    #[test]
    fn test_metadata_json_round_trip() {
        let meta = ArtifactMetadata::new("whisper-tiny").with_format(ArtifactFormat::Onnx);
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"declared_format\":\"onnx\""));
        let back: ArtifactMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("whisper-tiny").is_ok());
        assert!(matches!(validate_key(""), Err(CacheError::InvalidKey(_))));
        assert!(matches!(validate_key("   "), Err(CacheError::InvalidKey(_))));
    }

    #[test]
    fn test_file_stem_for_key() {
        assert_eq!(file_stem_for_key("whisper-tiny"), "whisper-tiny");
        assert_eq!(file_stem_for_key("model_v1.2"), "model_v1.2");
        assert_eq!(file_stem_for_key("org/model"), "~6f72672f6d6f64656c");
        assert!(file_stem_for_key("../etc").starts_with('~'));
        assert!(file_stem_for_key(".hidden").starts_with('~'));
        assert_ne!(file_stem_for_key("a b"), file_stem_for_key("a_b"));
    }
}
