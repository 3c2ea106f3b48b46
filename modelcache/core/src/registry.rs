//! Artifact Registry
//!
//! The entry point callers use to turn a key into bytes. Lookups go memory
//! tier first, then the durable store, then the download coordinator:
//!
//! ```text
//! resolve(key, source)
//!   ├─ MemoryTier hit ───────────────────────────► bytes
//!   ├─ ArtifactStore hit ─► populate MemoryTier ─► bytes
//!   ├─ source.url ─► join/start download ─► wait ─► ArtifactStore ─► bytes
//!   └─ no source ─────────────────────────────────► NotFound
//! ```
//!
//! Concurrent `resolve` calls for the same key share one download task and
//! therefore one outcome. The registry is an ordinary value; the application
//! constructs it once and hands it (usually behind an `Arc`) to its callers.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::download::{
    ArtifactFetcher, DownloadCoordinator, DownloadProgress, DownloadRequest, DownloadTask,
};
use crate::error::{CacheError, CacheResult};
use crate::format::ArtifactFormat;
use crate::memory::{MemoryStats, MemoryTier};
use crate::metadata::{validate_key, ArtifactBytes, ArtifactMetadata};
use crate::store::ArtifactStore;

/// Where an artifact can be fetched from and what it should look like
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Remote location; without it only cached copies resolve
    pub url: Option<String>,
    /// Expected digest, hex
    pub expected_checksum: Option<String>,
    /// Expected length
    pub expected_size_bytes: Option<u64>,
    /// Declared container format
    pub declared_format: Option<ArtifactFormat>,
    /// Human-readable name
    pub display_name: Option<String>,
}

impl SourceDescriptor {
    /// No remote source: resolve from cache only
    #[must_use]
    pub fn cached_only() -> Self {
        Self::default()
    }

    /// Fetch from `url` when not cached
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Set the expected digest
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }

    /// Set the expected length
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size_bytes = Some(size);
        self
    }

    /// Set the declared format
    #[must_use]
    pub fn with_format(mut self, format: ArtifactFormat) -> Self {
        self.declared_format = Some(format);
        self
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    fn download_request(&self, key: &str) -> Option<DownloadRequest> {
        let url = self.url.as_ref()?;
        let mut request = DownloadRequest::new(key, url.clone())
            .with_format(self.declared_format.unwrap_or_default());
        request.expected_checksum = self.expected_checksum.clone();
        request.expected_size_bytes = self.expected_size_bytes;
        request.display_name = self.display_name.clone();
        Some(request)
    }
}

/// Registry-wide usage figures
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Bytes held by the durable store
    pub durable_bytes: u64,
    /// Bytes held by the memory tier
    pub memory_bytes: u64,
    /// Entries in the durable store
    pub entry_count: usize,
    /// Entries in the memory tier
    pub memory_entries: usize,
    /// Downloads currently pending or running
    pub active_downloads: usize,
    /// Full memory tier counters
    pub memory: MemoryStats,
}

/// Memory tier + durable store + downloads behind one `resolve`
#[derive(Debug)]
pub struct ArtifactRegistry {
    store: Arc<ArtifactStore>,
    memory: MemoryTier,
    downloads: DownloadCoordinator,
    /// Bumped by every invalidation; a durable read taken before the bump
    /// must not repopulate the memory tier
    invalidations: Mutex<u64>,
}

impl ArtifactRegistry {
    /// Assemble a registry from its parts
    #[must_use]
    pub fn new(store: Arc<ArtifactStore>, memory: MemoryTier, downloads: DownloadCoordinator) -> Self {
        Self {
            store,
            memory,
            downloads,
            invalidations: Mutex::new(0),
        }
    }

    /// Open the store and build an HTTP-backed registry from configuration
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` if the store cannot be opened, or
    /// `CacheError::Network` if the HTTP client cannot be built.
    pub async fn open(config: &CacheConfig) -> CacheResult<Self> {
        let store = Arc::new(ArtifactStore::open(config.store.clone()).await?);
        let downloads = DownloadCoordinator::with_http(Arc::clone(&store), config.download.clone())?;
        Ok(Self::new(store, MemoryTier::from_config(&config.memory), downloads))
    }

    /// Like [`ArtifactRegistry::open`] with a custom transport
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` if the store cannot be opened.
    pub async fn open_with_fetcher(
        config: &CacheConfig,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> CacheResult<Self> {
        let store = Arc::new(ArtifactStore::open(config.store.clone()).await?);
        let downloads = DownloadCoordinator::new(Arc::clone(&store), fetcher, config.download.clone());
        Ok(Self::new(store, MemoryTier::from_config(&config.memory), downloads))
    }

    /// Durable store
    #[must_use]
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Memory tier
    #[must_use]
    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    /// Download coordinator
    #[must_use]
    pub fn downloads(&self) -> &DownloadCoordinator {
        &self.downloads
    }

    /// Resolve `key` to bytes, downloading from `source` if needed
    ///
    /// # Errors
    ///
    /// - `NotFound` if nothing is cached and `source` has no URL
    /// - `Cancelled` if the shared download was cancelled
    /// - the download or store error otherwise, unchanged
    pub async fn resolve(&self, key: &str, source: &SourceDescriptor) -> CacheResult<ArtifactBytes> {
        validate_key(key)?;

        if let Some(bytes) = self.memory.get(key) {
            tracing::debug!(key = %key, "Memory tier hit");
            if let Err(e) = self.store.record_access(key).await {
                tracing::warn!(key = %key, error = %e, "Failed to record access");
            }
            return Ok(bytes);
        }

        match self.read_durable(key).await {
            Ok(Some(bytes)) => return Ok(bytes),
            Ok(None) => {}
            // The corrupted entry is already evicted; refetch if we can
            Err(e @ CacheError::Corrupted { .. }) if source.url.is_some() => {
                tracing::warn!(key = %key, error = %e, "Cached copy corrupted, downloading again");
            }
            Err(e) => return Err(e),
        }

        let Some(request) = source.download_request(key) else {
            tracing::debug!(key = %key, "Not cached and no source to fetch from");
            return Err(CacheError::NotFound(key.to_string()));
        };

        let task = self.downloads.start_download(request)?;
        let outcome = task.wait().await?;
        for evicted in &outcome.evicted {
            self.memory.invalidate(evicted);
        }

        self.read_durable(key)
            .await?
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    /// [`ArtifactRegistry::resolve`] bounded by a total duration
    ///
    /// The deadline only abandons this caller's wait; a download it started
    /// keeps running for other callers.
    ///
    /// # Errors
    ///
    /// `Timeout` when the deadline passes; otherwise as `resolve`.
    pub async fn resolve_with_timeout(
        &self,
        key: &str,
        source: &SourceDescriptor,
        timeout: Duration,
    ) -> CacheResult<ArtifactBytes> {
        match tokio::time::timeout(timeout, self.resolve(key, source)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                key: key.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Start fetching `key` in the background
    ///
    /// Returns `None` if a valid durable copy already exists.
    ///
    /// # Errors
    ///
    /// `NotFound` if `source` has no URL; `InvalidKey` for an unusable key.
    pub async fn prefetch(
        &self,
        key: &str,
        source: &SourceDescriptor,
    ) -> CacheResult<Option<DownloadTask>> {
        validate_key(key)?;
        if self.store.has_valid_entry(key).await {
            tracing::debug!(key = %key, "Prefetch skipped, already stored");
            return Ok(None);
        }
        let request = source
            .download_request(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
        self.downloads.start_download(request).map(Some)
    }

    /// Drop `key` from every tier, cancelling an in-flight download first
    ///
    /// # Errors
    ///
    /// `Io` if the durable files cannot be removed.
    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        validate_key(key)?;
        if let Some(task) = self.downloads.task(key) {
            task.cancel();
            // Outcome is irrelevant; only wait until it can no longer write
            let _ = task.wait().await;
        }
        let deleted = self.store.delete(key).await;
        {
            let mut invalidations = self.invalidations.lock();
            *invalidations += 1;
            self.memory.invalidate(key);
        }
        deleted?;
        tracing::info!(key = %key, "Artifact invalidated");
        Ok(())
    }

    /// Usage across both tiers
    ///
    /// # Errors
    ///
    /// `Io` if the store cannot be listed.
    pub async fn stats(&self) -> CacheResult<RegistryStats> {
        let entries = self.store.list_entries().await?;
        let memory = self.memory.stats();
        Ok(RegistryStats {
            durable_bytes: entries.iter().map(|m| m.size_bytes).sum(),
            memory_bytes: memory.current_bytes,
            entry_count: entries.len(),
            memory_entries: memory.entry_count,
            active_downloads: self.downloads.active_downloads().len(),
            memory,
        })
    }

    /// Progress of the active download for `key`, if any
    ///
    /// The stream ends at the task's terminal state. A later download of the
    /// same key is a new task and needs a new subscription.
    #[must_use]
    pub fn observe_download(&self, key: &str) -> Option<BoxStream<'static, DownloadProgress>> {
        self.downloads.observe(key)
    }

    /// Metadata of every durable artifact, most recently used first
    ///
    /// # Errors
    ///
    /// `Io` if the store cannot be listed.
    pub async fn cached_artifacts(&self) -> CacheResult<Vec<ArtifactMetadata>> {
        self.store.list_entries().await
    }

    /// Release the memory tier, e.g. on an OS memory warning
    ///
    /// Returns the number of bytes released.
    pub fn handle_memory_pressure(&self) -> u64 {
        let released = self.memory.stats().current_bytes;
        self.memory.clear();
        tracing::info!(released_bytes = released, "Memory tier cleared under pressure");
        released
    }

    async fn read_durable(&self, key: &str) -> CacheResult<Option<ArtifactBytes>> {
        let epoch = *self.invalidations.lock();
        match self.store.get(key).await? {
            Some((_, bytes)) => {
                tracing::debug!(key = %key, "Durable store hit");
                self.populate_memory(key, &bytes, epoch);
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Cache `bytes` in memory unless an invalidation happened since `epoch`
    fn populate_memory(&self, key: &str, bytes: &ArtifactBytes, epoch: u64) -> bool {
        let invalidations = self.invalidations.lock();
        if *invalidations != epoch {
            tracing::debug!(key = %key, "Invalidated during read, not caching in memory");
            return false;
        }
        self.memory.put(key, bytes.clone())
    }
}
