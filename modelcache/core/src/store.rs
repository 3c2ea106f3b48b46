//! Durable Artifact Store
//!
//! Crash-consistent filesystem storage for `(metadata, bytes)` pairs.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── meta/<stem>.json           entry record: metadata + blob file name
//! ├── blobs/<stem>.<uuid>.bin    fully written artifact bytes
//! ├── staging/                   in-progress writes, never visible
//! └── downloads/<stem>.part      resumable partial downloads
//! ```
//!
//! # Promotion
//!
//! Bytes are written and synced under `staging/`, validated there, renamed to
//! a fresh blob name and only then is the entry record swapped in with an
//! atomic rename. The record is the visibility switch: a reader (or another
//! process listing the directory) never finds a record whose blob is not
//! fully written. Replacing a key swaps the record first and deletes the
//! previous blob afterwards.
//!
//! Every operation on a key holds that key's async mutex, so a `put` is fully
//! promoted before a later `get`/`put`/`delete` of the same key starts.
//! Different keys proceed concurrently.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::checksum::{self, digests_match, ChecksumAlgorithm};
use crate::error::{CacheError, CacheResult};
use crate::format;
use crate::metadata::{file_stem_for_key, validate_key, ArtifactBytes, ArtifactMetadata};

const META_DIR: &str = "meta";
const BLOBS_DIR: &str = "blobs";
const STAGING_DIR: &str = "staging";
const DOWNLOADS_DIR: &str = "downloads";

/// What to do when detected and declared formats disagree
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatPolicy {
    /// Reject the write with `FormatMismatch`
    #[default]
    Strict,
    /// Log a warning and store anyway
    Warn,
}

impl std::str::FromStr for FormatPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "fatal" => Ok(Self::Strict),
            "warn" | "warning" => Ok(Self::Warn),
            other => Err(format!("unknown format policy '{other}'")),
        }
    }
}

/// Durable store configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Cache root directory
    pub root: PathBuf,
    /// Optional quota; least recently used entries are evicted to respect it
    pub max_storage_bytes: Option<u64>,
    /// Free disk space that writes must leave untouched
    pub min_free_space_bytes: u64,
    /// Re-hash blobs on every read instead of only checking their size
    pub verify_checksum_on_read: bool,
    /// Severity of a format mismatch on `put`
    pub format_policy: FormatPolicy,
}

impl StoreConfig {
    /// Configuration rooted at `root` with defaults elsewhere
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_storage_bytes: None,
            min_free_space_bytes: 0,
            verify_checksum_on_read: false,
            format_policy: FormatPolicy::Strict,
        }
    }
}

/// Default cache root: `$XDG_CACHE_HOME/modelcache`
#[must_use]
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("modelcache")
}

/// On-disk entry record
#[derive(Clone, Debug, Serialize, Deserialize)]
struct EntryRecord {
    metadata: ArtifactMetadata,
    /// Blob file name under `blobs/`
    blob: String,
}

/// Result of a successful `put`
#[derive(Clone, Debug)]
pub struct PutOutcome {
    /// Metadata as stored
    pub metadata: ArtifactMetadata,
    /// Keys evicted to stay within the storage quota
    pub evicted: Vec<String>,
}

/// What startup recovery cleaned up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Abandoned staging files removed
    pub staging_removed: usize,
    /// Blobs without an entry record removed
    pub orphan_blobs_removed: usize,
}

/// Durable key-value store for artifact blobs and metadata
#[derive(Debug)]
pub struct ArtifactStore {
    config: StoreConfig,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    quota_lock: Mutex<()>,
}

impl ArtifactStore {
    /// Open (creating if needed) the store and clean up interrupted writes
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` if the directory layout cannot be created.
    pub async fn open(config: StoreConfig) -> CacheResult<Self> {
        for dir in [META_DIR, BLOBS_DIR, STAGING_DIR, DOWNLOADS_DIR] {
            tokio::fs::create_dir_all(config.root.join(dir)).await?;
        }

        let store = Self {
            config,
            key_locks: DashMap::new(),
            quota_lock: Mutex::new(()),
        };

        let report = store.recover().await?;
        if report != RecoveryReport::default() {
            tracing::info!(
                staging_removed = report.staging_removed,
                orphan_blobs_removed = report.orphan_blobs_removed,
                "Recovered artifact store after interrupted writes"
            );
        }
        tracing::debug!(root = %store.config.root.display(), "Artifact store opened");
        Ok(store)
    }

    /// Store configuration
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Cache root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Directory holding in-progress writes
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.config.root.join(STAGING_DIR)
    }

    /// Directory holding promoted blobs
    #[must_use]
    pub fn blobs_dir(&self) -> PathBuf {
        self.config.root.join(BLOBS_DIR)
    }

    /// Where a resumable download of `key` keeps its bytes
    #[must_use]
    pub fn partial_download_path(&self, key: &str) -> PathBuf {
        self.config
            .root
            .join(DOWNLOADS_DIR)
            .join(format!("{}.part", file_stem_for_key(key)))
    }

    /// Sidecar recording which URL a partial download came from
    #[must_use]
    pub fn partial_sidecar_path(&self, key: &str) -> PathBuf {
        self.config
            .root
            .join(DOWNLOADS_DIR)
            .join(format!("{}.part.json", file_stem_for_key(key)))
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.config
            .root
            .join(META_DIR)
            .join(format!("{}.json", file_stem_for_key(key)))
    }

    fn staging_path(&self, key: &str, suffix: &str) -> PathBuf {
        self.staging_dir().join(format!(
            "{}.{}.{suffix}",
            file_stem_for_key(key),
            Uuid::new_v4().simple()
        ))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let guard = self.key_lock(key).lock_owned().await;
        KeyGuard::new(&self.key_locks, key, guard)
    }

    fn try_lock_key(&self, key: &str) -> Option<KeyGuard<'_>> {
        match self.key_lock(key).try_lock_owned() {
            Ok(guard) => Some(KeyGuard::new(&self.key_locks, key, guard)),
            Err(_) => None,
        }
    }

    /// Store `bytes` under `key`
    ///
    /// The payload is staged, validated (size, checksum, format) and then
    /// atomically promoted. On any failure the store is left exactly as it
    /// was before the call.
    ///
    /// # Errors
    ///
    /// - `InsufficientStorage` if free space or quota cannot fit the payload
    /// - `SizeMismatch`, `ChecksumMismatch`, `FormatMismatch` on validation
    /// - `Io` for filesystem failures
    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: ArtifactMetadata,
    ) -> CacheResult<PutOutcome> {
        validate_key(key)?;
        let _guard = self.lock_key(key).await;

        self.ensure_free_space(bytes.len() as u64).await?;

        let staged = self.staging_path(key, "tmp");
        let written = write_synced(&staged, bytes).await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }

        self.commit_staged(key, &staged, metadata).await
    }

    /// Store the file at `source` under `key`, consuming it
    ///
    /// Used for downloads: the artifact is moved into staging rather than
    /// read into memory. `source` is removed whether or not the commit
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Same as [`ArtifactStore::put`].
    pub async fn put_file(
        &self,
        key: &str,
        source: &Path,
        metadata: ArtifactMetadata,
    ) -> CacheResult<PutOutcome> {
        validate_key(key)?;
        let _guard = self.lock_key(key).await;

        let staged = self.staging_path(key, "tmp");
        if tokio::fs::rename(source, &staged).await.is_err() {
            // Different filesystem: copy, then drop the source
            let len = tokio::fs::metadata(source).await?.len();
            if let Err(e) = self.ensure_free_space(len).await {
                let _ = tokio::fs::remove_file(source).await;
                return Err(e);
            }
            let copied = tokio::fs::copy(source, &staged).await;
            let _ = tokio::fs::remove_file(source).await;
            if let Err(e) = copied {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(e.into());
            }
        }

        self.commit_staged(key, &staged, metadata).await
    }

    /// Validate a staged blob and promote it. Caller holds the key lock.
    async fn commit_staged(
        &self,
        key: &str,
        staged: &Path,
        metadata: ArtifactMetadata,
    ) -> CacheResult<PutOutcome> {
        let result = self.validate_and_promote(key, staged, metadata).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(staged).await;
        }
        result
    }

    async fn validate_and_promote(
        &self,
        key: &str,
        staged: &Path,
        mut metadata: ArtifactMetadata,
    ) -> CacheResult<PutOutcome> {
        let size = tokio::fs::metadata(staged).await?.len();
        if let Some(expected) = metadata.expected_size_bytes {
            if expected != size {
                return Err(CacheError::SizeMismatch {
                    expected,
                    actual: size,
                });
            }
        }

        let digest = checksum::checksum_file(staged).await?;
        if let Some(expected) = metadata.expected_checksum.as_deref() {
            if !digests_match(&digest, expected) {
                tracing::warn!(key = %key, expected = %expected, actual = %digest, "Checksum mismatch, discarding staged artifact");
                return Err(CacheError::ChecksumMismatch {
                    expected: checksum::normalize_digest(expected),
                    actual: digest,
                });
            }
        }

        let hint = metadata
            .source_url
            .clone()
            .unwrap_or_else(|| metadata.display_name.clone());
        let detected = format::detect_path(staged, Some(&hint)).await;
        if metadata.declared_format.is_known() && detected != metadata.declared_format {
            match self.config.format_policy {
                FormatPolicy::Strict => {
                    return Err(CacheError::FormatMismatch {
                        expected: metadata.declared_format,
                        detected,
                    });
                }
                FormatPolicy::Warn => {
                    tracing::warn!(
                        key = %key,
                        declared = %metadata.declared_format,
                        detected = %detected,
                        "Format mismatch, storing anyway"
                    );
                }
            }
        }

        let now = chrono::Utc::now();
        metadata.key = key.to_string();
        metadata.size_bytes = size;
        metadata.checksum = Some(digest);
        metadata.checksum_algorithm = ChecksumAlgorithm::Sha256;
        metadata.detected_format = detected;
        metadata.created_at = now;
        metadata.last_accessed_at = now;
        metadata.access_count = 0;

        let _quota_guard = match self.config.max_storage_bytes {
            Some(_) => Some(self.quota_lock.lock().await),
            None => None,
        };
        let evicted = self.ensure_capacity(size, key).await?;

        let previous = self.read_record(key).await.ok().flatten();

        let blob = format!("{}.{}.bin", file_stem_for_key(key), Uuid::new_v4().simple());
        let blob_path = self.blobs_dir().join(&blob);
        tokio::fs::rename(staged, &blob_path).await?;

        let record = EntryRecord {
            metadata: metadata.clone(),
            blob,
        };
        if let Err(e) = self.write_record(key, &record).await {
            let _ = tokio::fs::remove_file(&blob_path).await;
            return Err(e);
        }

        if let Some(old) = previous {
            if old.blob != record.blob {
                let _ = tokio::fs::remove_file(self.blobs_dir().join(&old.blob)).await;
            }
        }

        tracing::info!(
            key = %key,
            size_bytes = size,
            format = %detected,
            "Artifact promoted to durable store"
        );

        Ok(PutOutcome { metadata, evicted })
    }

    /// Read an artifact, recording the access
    ///
    /// Returns `Ok(None)` when the key is absent. A blob that is missing,
    /// truncated or (with `verify_checksum_on_read`) fails its digest is
    /// evicted and reported as `Corrupted`.
    ///
    /// # Errors
    ///
    /// `Corrupted` as above; `Io` for other filesystem failures.
    pub async fn get(&self, key: &str) -> CacheResult<Option<(ArtifactMetadata, ArtifactBytes)>> {
        validate_key(key)?;
        let _guard = self.lock_key(key).await;

        let mut record = match self.read_record(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(CacheError::Metadata(reason)) => {
                return Err(self.evict_corrupted(key, None, reason).await);
            }
            Err(e) => return Err(e),
        };

        let blob_path = self.blobs_dir().join(&record.blob);
        let bytes = match tokio::fs::read(&blob_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self
                    .evict_corrupted(key, Some(&record), "blob file is missing".into())
                    .await);
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.len() as u64 != record.metadata.size_bytes {
            let reason = format!(
                "blob is {} bytes, expected {}",
                bytes.len(),
                record.metadata.size_bytes
            );
            return Err(self.evict_corrupted(key, Some(&record), reason).await);
        }

        if self.config.verify_checksum_on_read {
            if let Some(expected) = record.metadata.checksum.clone() {
                let actual = checksum::compute_checksum(&bytes);
                if !digests_match(&actual, &expected) {
                    let reason = format!("checksum {actual} does not match recorded {expected}");
                    return Err(self.evict_corrupted(key, Some(&record), reason).await);
                }
            }
        }

        record.metadata.touch();
        self.write_record(key, &record).await?;
        tracing::debug!(key = %key, size_bytes = bytes.len(), "Durable store hit");

        Ok(Some((record.metadata, ArtifactBytes::from(bytes))))
    }

    /// Metadata only, without reading the blob or recording an access
    ///
    /// # Errors
    ///
    /// `Metadata` if the record cannot be parsed; `Io` otherwise.
    pub async fn get_metadata(&self, key: &str) -> CacheResult<Option<ArtifactMetadata>> {
        validate_key(key)?;
        let _guard = self.lock_key(key).await;
        Ok(self.read_record(key).await?.map(|r| r.metadata))
    }

    /// Record a read served without touching the blob, e.g. from memory
    ///
    /// Updates `last_accessed_at` and `access_count` so listings and quota
    /// eviction see the access. Absent keys are ignored.
    ///
    /// # Errors
    ///
    /// `Metadata` if the record cannot be parsed; `Io` otherwise.
    pub async fn record_access(&self, key: &str) -> CacheResult<()> {
        validate_key(key)?;
        let _guard = self.lock_key(key).await;
        let Some(mut record) = self.read_record(key).await? else {
            return Ok(());
        };
        record.metadata.touch();
        self.write_record(key, &record).await
    }

    /// Path of the blob backing `key`, for callers that map large artifacts
    /// instead of reading them
    ///
    /// # Errors
    ///
    /// `Metadata` if the record cannot be parsed; `Io` otherwise.
    pub async fn blob_path(&self, key: &str) -> CacheResult<Option<PathBuf>> {
        validate_key(key)?;
        let _guard = self.lock_key(key).await;
        Ok(self
            .read_record(key)
            .await?
            .map(|r| self.blobs_dir().join(r.blob)))
    }

    /// Whether `key` has a record whose blob is present at the recorded size
    pub async fn has_valid_entry(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        let _guard = self.lock_key(key).await;
        let Ok(Some(record)) = self.read_record(key).await else {
            return false;
        };
        match tokio::fs::metadata(self.blobs_dir().join(&record.blob)).await {
            Ok(meta) => meta.len() == record.metadata.size_bytes,
            Err(_) => false,
        }
    }

    /// Remove an artifact. Deleting an absent key succeeds.
    ///
    /// # Errors
    ///
    /// `Io` if the files exist but cannot be removed.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        validate_key(key)?;
        let _guard = self.lock_key(key).await;
        let removed = self.remove_entry_files(key).await?;
        if removed {
            tracing::info!(key = %key, "Artifact deleted from durable store");
        }
        Ok(())
    }

    /// Keys ordered by last access, most recent first
    ///
    /// # Errors
    ///
    /// `Io` if the metadata directory cannot be read.
    pub async fn list_keys(&self) -> CacheResult<Vec<String>> {
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect())
    }

    /// Metadata of every entry, most recently accessed first
    ///
    /// Each call re-reads the directory. Unreadable records are skipped.
    ///
    /// # Errors
    ///
    /// `Io` if the metadata directory cannot be read.
    pub async fn list_entries(&self) -> CacheResult<Vec<ArtifactMetadata>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(self.config.root.join(META_DIR)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record_at(&path).await {
                Ok(Some(record)) => entries.push(record.metadata),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable entry record");
                }
            }
        }

        entries.sort_by(|a, b| {
            b.last_accessed_at
                .cmp(&a.last_accessed_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(entries)
    }

    /// Sum of all stored artifact sizes
    ///
    /// # Errors
    ///
    /// `Io` if the metadata directory cannot be read.
    pub async fn total_size_bytes(&self) -> CacheResult<u64> {
        Ok(self
            .list_entries()
            .await?
            .iter()
            .map(|m| m.size_bytes)
            .sum())
    }

    /// Free bytes on the cache filesystem
    ///
    /// # Errors
    ///
    /// `Io` if the filesystem cannot be queried.
    pub async fn available_space(&self) -> CacheResult<u64> {
        let root = self.config.root.clone();
        let queried = tokio::task::spawn_blocking(move || free_space(&root))
            .await
            .map_err(|e| CacheError::Io(Arc::new(std::io::Error::other(e))))?;
        Ok(queried?)
    }

    /// Fail unless `required` more bytes fit on the cache filesystem while
    /// keeping `min_free_space_bytes` free
    ///
    /// # Errors
    ///
    /// `InsufficientStorage` when they do not fit; `Io` if the filesystem
    /// cannot be queried.
    pub async fn ensure_free_space(&self, required: u64) -> CacheResult<()> {
        let available = self
            .available_space()
            .await?
            .saturating_sub(self.config.min_free_space_bytes);
        if required > available {
            return Err(CacheError::InsufficientStorage {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Evict least recently used entries (never `exclude`) until `required`
    /// more bytes fit under the quota. Caller holds the quota lock.
    async fn ensure_capacity(&self, required: u64, exclude: &str) -> CacheResult<Vec<String>> {
        let Some(max) = self.config.max_storage_bytes else {
            return Ok(Vec::new());
        };

        let entries = self.list_entries().await?;
        let mut used: u64 = entries
            .iter()
            .filter(|m| m.key != exclude)
            .map(|m| m.size_bytes)
            .sum();

        if used.saturating_add(required) <= max {
            return Ok(Vec::new());
        }

        // Lock every victim before removing any, so a failing put evicts
        // nothing. Busy keys belong to another operation and are passed over.
        let mut plan = Vec::new();
        let mut projected = used;
        for meta in entries.iter().rev().filter(|m| m.key != exclude) {
            if projected.saturating_add(required) <= max {
                break;
            }
            let Some(guard) = self.try_lock_key(&meta.key) else {
                tracing::debug!(key = %meta.key, "Eviction candidate busy, skipping");
                continue;
            };
            projected = projected.saturating_sub(meta.size_bytes);
            plan.push((meta, guard));
        }
        if projected.saturating_add(required) > max {
            return Err(CacheError::InsufficientStorage {
                required,
                available: max.saturating_sub(used),
            });
        }

        let mut evicted = Vec::new();
        for (meta, _victim_guard) in plan {
            if self.remove_entry_files(&meta.key).await? {
                used = used.saturating_sub(meta.size_bytes);
                tracing::info!(
                    key = %meta.key,
                    size_bytes = meta.size_bytes,
                    "Evicted artifact from durable store to respect quota"
                );
                evicted.push(meta.key.clone());
            }
        }
        tracing::debug!(used_bytes = used, max_bytes = max, "Quota satisfied");
        Ok(evicted)
    }

    /// Remove record then blob. Caller holds the key lock.
    async fn remove_entry_files(&self, key: &str) -> CacheResult<bool> {
        let record = self.read_record(key).await.ok().flatten();

        let existed = match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if let Some(record) = record {
            match tokio::fs::remove_file(self.blobs_dir().join(&record.blob)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(existed)
    }

    async fn evict_corrupted(
        &self,
        key: &str,
        record: Option<&EntryRecord>,
        reason: String,
    ) -> CacheError {
        tracing::warn!(key = %key, reason = %reason, "Corrupted artifact, evicting");
        let _ = tokio::fs::remove_file(self.record_path(key)).await;
        match record {
            Some(record) => {
                let _ = tokio::fs::remove_file(self.blobs_dir().join(&record.blob)).await;
            }
            // Unreadable record: find the blob by name
            None => self.remove_blobs_of(key).await,
        }
        CacheError::Corrupted {
            key: key.to_string(),
            reason,
        }
    }

    async fn remove_blobs_of(&self, key: &str) {
        let stem = file_stem_for_key(key);
        let Ok(mut blobs) = tokio::fs::read_dir(self.blobs_dir()).await else {
            return;
        };
        while let Ok(Some(entry)) = blobs.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_blob_of(&stem, &name) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    async fn read_record(&self, key: &str) -> CacheResult<Option<EntryRecord>> {
        read_record_at(&self.record_path(key)).await
    }

    async fn write_record(&self, key: &str, record: &EntryRecord) -> CacheResult<()> {
        let json = serde_json::to_vec_pretty(record)?;
        let staged = self.staging_path(key, "json.tmp");
        if let Err(e) = write_synced(&staged, &json).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&staged, self.record_path(key)).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove abandoned staging files and unreferenced blobs
    async fn recover(&self) -> CacheResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let mut staging = tokio::fs::read_dir(self.staging_dir()).await?;
        while let Some(entry) = staging.next_entry().await? {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                report.staging_removed += 1;
            }
        }

        let mut referenced = HashSet::new();
        let mut meta_dir = tokio::fs::read_dir(self.config.root.join(META_DIR)).await?;
        while let Some(entry) = meta_dir.next_entry().await? {
            if let Ok(Some(record)) = read_record_at(&entry.path()).await {
                referenced.insert(record.blob);
            }
        }

        let mut blobs = tokio::fs::read_dir(self.blobs_dir()).await?;
        while let Some(entry) = blobs.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) && tokio::fs::remove_file(entry.path()).await.is_ok() {
                report.orphan_blobs_removed += 1;
            }
        }

        Ok(report)
    }
}

/// Held key lock. Drops the key's mutex from the table once no other task
/// holds or waits on it.
struct KeyGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<'a> KeyGuard<'a> {
    fn new(locks: &'a DashMap<String, Arc<Mutex<()>>>, key: &str, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            locks,
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Whether `name` is a blob file (`<stem>.<uuid>.bin`) written for `stem`
fn is_blob_of(stem: &str, name: &str) -> bool {
    name.strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(".bin"))
        .is_some_and(|id| id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()))
}

async fn read_record_at(path: &Path) -> CacheResult<Option<EntryRecord>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let record = serde_json::from_slice(&raw)?;
    Ok(Some(record))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn free_space(path: &Path) -> std::io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: statvfs only writes into the zeroed struct we pass
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> std::io::Result<u64> {
    Ok(u64::MAX)
}
