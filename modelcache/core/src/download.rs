//! Download Coordinator
//!
//! Fetches remote artifacts into the durable store with progress reporting,
//! resumable transfers and at most one in-flight fetch per key.
//!
//! # Lifecycle
//!
//! ```text
//! (idle) -> Pending -> Downloading -> Completed
//!                                  -> Failed
//!                                  -> Cancelled
//! ```
//!
//! A task is `Pending` until the transport delivers its first chunk. The
//! in-flight table maps a key to its current task; the check for an active
//! task and the insertion of a new one happen under a single lock. Terminal
//! tasks leave the table, and a later `start_download` creates a fresh task.
//!
//! Bytes stream into `<root>/downloads/<key>.part`. Transient network errors
//! are retried with exponential backoff and resume from the partial file via
//! `Range: bytes=N-`. Once the transfer is complete the partial file is handed
//! to [`ArtifactStore::put_file`]; the task only completes after that commit
//! succeeds.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};
use crate::format::ArtifactFormat;
use crate::metadata::{validate_key, ArtifactMetadata};
use crate::store::{ArtifactStore, PutOutcome};

/// Progress events buffered per subscriber before it starts lagging
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

/// Download behaviour
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Total attempts per task, including the first
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub retry_base_delay_ms: u64,
    /// Upper bound on a single retry delay
    pub retry_max_delay_ms: u64,
    /// Fail the task if no chunk arrives for this long
    pub stall_timeout_secs: u64,
    /// TCP connect timeout for the HTTP fetcher
    pub connect_timeout_secs: u64,
    /// Write buffer for partial files
    pub chunk_size_bytes: usize,
    /// User-Agent sent by the HTTP fetcher
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            stall_timeout_secs: 30,
            connect_timeout_secs: 30,
            chunk_size_bytes: 1024 * 1024,
            user_agent: format!("modelcache/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Body of a fetch, positioned at the requested offset or at zero
pub struct FetchResponse {
    /// Full artifact length, if the server reported it
    pub total_len: Option<u64>,
    /// True if the body continues from the requested offset
    pub resumed: bool,
    /// Body chunks
    pub stream: BoxStream<'static, CacheResult<Bytes>>,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("total_len", &self.total_len)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

/// Source of artifact bytes
///
/// `offset > 0` asks the transport to resume. Implementations that cannot
/// resume return the full body with `resumed == false`.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Open a body stream for `url`, starting at `offset` if supported
    async fn fetch(&self, url: &str, offset: u64) -> CacheResult<FetchResponse>;
}

/// HTTP(S) fetcher backed by `reqwest`
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a client from download settings
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Network` if the TLS backend cannot initialise.
    pub fn new(config: &DownloadConfig) -> CacheResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, offset: u64) -> CacheResult<FetchResponse> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            tracing::debug!(url = %url, offset, "Range rejected, restarting from zero");
            return self.fetch(url, 0).await;
        }
        if !status.is_success() {
            return Err(CacheError::Network(format!("GET {url} returned {status}")));
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let total_len = if resumed {
            content_range_total(&response)
                .or_else(|| response.content_length().map(|len| len + offset))
        } else {
            response.content_length()
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CacheError::from))
            .boxed();

        Ok(FetchResponse {
            total_len,
            resumed,
            stream,
        })
    }
}

/// Total from `Content-Range: bytes a-b/total`
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    value.rsplit_once('/')?.1.trim().parse().ok()
}

// ============================================================================
// Task state
// ============================================================================

/// Download task status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Created, waiting for the first byte
    #[default]
    Pending,
    /// Receiving bytes
    Downloading,
    /// Stored durably
    Completed,
    /// Gave up
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl DownloadStatus {
    /// Whether the task has reached a final state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the task can still be joined
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Lowercase label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a download
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DownloadProgress {
    /// Task status at the time of the update
    pub status: DownloadStatus,
    /// Bytes present in the partial file
    pub bytes_downloaded: u64,
    /// Full artifact length, if known
    pub total_bytes: Option<u64>,
    /// `bytes_downloaded / total_bytes` in percent, if the total is known
    pub percentage: Option<f64>,
    /// Throughput of the current attempt
    pub speed_bytes_per_sec: f64,
    /// Estimated time to completion
    pub eta_millis: Option<u64>,
}

impl DownloadProgress {
    fn pending(total_bytes: Option<u64>) -> Self {
        Self::measure(DownloadStatus::Pending, 0, total_bytes, 0, Duration::ZERO)
    }

    fn measure(
        status: DownloadStatus,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        session_bytes: u64,
        elapsed: Duration,
    ) -> Self {
        let percentage = total_bytes.filter(|t| *t > 0).map(|total| {
            (bytes_downloaded as f64 / total as f64 * 100.0).min(100.0)
        });

        let secs = elapsed.as_secs_f64();
        let speed_bytes_per_sec = if secs > 0.0 {
            session_bytes as f64 / secs
        } else {
            0.0
        };

        let eta_millis = match total_bytes {
            Some(total) if speed_bytes_per_sec > 0.0 => {
                let remaining = total.saturating_sub(bytes_downloaded) as f64;
                Some((remaining / speed_bytes_per_sec * 1000.0) as u64)
            }
            _ => None,
        };

        Self {
            status,
            bytes_downloaded,
            total_bytes,
            percentage,
            speed_bytes_per_sec,
            eta_millis,
        }
    }
}

/// Stored result of a finished download
pub type DownloadOutcome = PutOutcome;

/// Terminal result shared by every caller joined to a task
pub type DownloadResult = Result<DownloadOutcome, CacheError>;

/// What to download and how to validate it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Artifact key
    pub key: String,
    /// Remote location
    pub url: String,
    /// Expected digest, hex
    pub expected_checksum: Option<String>,
    /// Expected length
    pub expected_size_bytes: Option<u64>,
    /// Declared container format
    pub declared_format: ArtifactFormat,
    /// Human-readable name
    pub display_name: Option<String>,
}

impl DownloadRequest {
    /// Download `url` into `key` with nothing declared
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            expected_checksum: None,
            expected_size_bytes: None,
            declared_format: ArtifactFormat::Unknown,
            display_name: None,
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
        self.declared_format = format;
        self
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    fn metadata(&self) -> ArtifactMetadata {
        let mut metadata = ArtifactMetadata::new(self.key.clone())
            .with_format(self.declared_format)
            .with_source_url(self.url.clone());
        if let Some(name) = &self.display_name {
            metadata = metadata.with_display_name(name.clone());
        }
        if let Some(checksum) = &self.expected_checksum {
            metadata = metadata.with_expected_checksum(checksum.clone());
        }
        if let Some(size) = self.expected_size_bytes {
            metadata = metadata.with_expected_size(size);
        }
        metadata
    }
}

#[derive(Debug)]
struct TaskShared {
    id: Uuid,
    key: String,
    url: String,
    started_at: DateTime<Utc>,
    seq: AtomicU64,
    progress: watch::Sender<(u64, DownloadProgress)>,
    events: broadcast::Sender<(u64, DownloadProgress)>,
    result: watch::Sender<Option<DownloadResult>>,
    cancel: watch::Sender<bool>,
}

impl TaskShared {
    fn snapshot(&self) -> DownloadProgress {
        self.progress.borrow().1.clone()
    }

    fn publish(&self, progress: DownloadProgress) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.progress.send_replace((seq, progress.clone()));
        // No subscribers is fine
        let _ = self.events.send((seq, progress));
    }

    fn finish(&self, result: DownloadResult) {
        let mut progress = self.snapshot();
        progress.status = match &result {
            Ok(_) => DownloadStatus::Completed,
            Err(CacheError::Cancelled(_)) => DownloadStatus::Cancelled,
            Err(_) => DownloadStatus::Failed,
        };
        progress.eta_millis = None;
        if let Ok(outcome) = &result {
            let size = outcome.metadata.size_bytes;
            progress.bytes_downloaded = size;
            progress.total_bytes = Some(size);
            progress.percentage = Some(100.0);
            progress.eta_millis = Some(0);
        }
        self.publish(progress);
        self.result.send_replace(Some(result));
    }
}

/// Handle to a download task
///
/// Cheap to clone; every clone observes the same task.
#[derive(Clone, Debug)]
pub struct DownloadTask {
    shared: Arc<TaskShared>,
}

impl DownloadTask {
    fn new(request: &DownloadRequest) -> (Self, watch::Receiver<bool>) {
        let (progress, _) = watch::channel((0, DownloadProgress::pending(request.expected_size_bytes)));
        let (events, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let (result, _) = watch::channel(None);
        let (cancel, cancel_rx) = watch::channel(false);

        let task = Self {
            shared: Arc::new(TaskShared {
                id: Uuid::new_v4(),
                key: request.key.clone(),
                url: request.url.clone(),
                started_at: Utc::now(),
                seq: AtomicU64::new(0),
                progress,
                events,
                result,
                cancel,
            }),
        };
        (task, cancel_rx)
    }

    /// Unique task id
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Artifact key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Source URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// When the task was created
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.shared.progress.borrow().1.status
    }

    /// Latest progress
    #[must_use]
    pub fn snapshot(&self) -> DownloadProgress {
        self.shared.snapshot()
    }

    /// Progress updates, starting with the current snapshot
    ///
    /// The stream yields at least one item per received chunk and ends after
    /// the terminal update. A subscriber that falls far behind skips ahead to
    /// the newest updates. Subscribing to a finished task yields its final
    /// snapshot only.
    pub fn subscribe(&self) -> BoxStream<'static, DownloadProgress> {
        let rx = self.shared.events.subscribe();
        let (seq, snapshot) = self.shared.progress.borrow().clone();

        if snapshot.status.is_terminal() {
            return stream::iter([snapshot]).boxed();
        }

        let rest = stream::unfold((rx, seq, false), |(mut rx, last, done)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok((seq, _)) if seq <= last => {}
                    Ok((seq, progress)) => {
                        let terminal = progress.status.is_terminal();
                        return Some((progress, (rx, seq, terminal)));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter([snapshot]).chain(rest).boxed()
    }

    /// Wait for the terminal result
    pub async fn wait(&self) -> DownloadResult {
        let mut rx = self.shared.result.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(CacheError::Cancelled(self.shared.key.clone())))
    }

    /// Request cancellation; no effect once the task is terminal
    pub fn cancel(&self) {
        self.shared.cancel.send_replace(true);
    }

    /// Whether the task reached a terminal state
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Number of callers currently blocked in [`DownloadTask::wait`]
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.shared.result.receiver_count()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Single-flight download manager
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: Arc<ArtifactStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    config: DownloadConfig,
    in_flight: Mutex<HashMap<String, DownloadTask>>,
}

impl fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("config", &self.inner.config)
            .field("in_flight", &self.inner.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

impl DownloadCoordinator {
    /// Create a coordinator writing into `store` through `fetcher`
    pub fn new(
        store: Arc<ArtifactStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                fetcher,
                config,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a coordinator using [`HttpFetcher`]
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Network` if the HTTP client cannot be built.
    pub fn with_http(store: Arc<ArtifactStore>, config: DownloadConfig) -> CacheResult<Self> {
        let fetcher = HttpFetcher::new(&config)?;
        Ok(Self::new(store, Arc::new(fetcher), config))
    }

    /// Download settings
    #[must_use]
    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    /// Start downloading, or join the active task for the same key
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidKey` for an unusable key.
    pub fn start_download(&self, request: DownloadRequest) -> CacheResult<DownloadTask> {
        validate_key(&request.key)?;

        let (task, cancel_rx) = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(existing) = in_flight.get(&request.key) {
                if existing.status().is_active() {
                    tracing::debug!(key = %request.key, task_id = %existing.id(), "Joining in-flight download");
                    return Ok(existing.clone());
                }
            }
            let (task, cancel_rx) = DownloadTask::new(&request);
            in_flight.insert(request.key.clone(), task.clone());
            (task, cancel_rx)
        };

        let inner = Arc::clone(&self.inner);
        let worker_task = task.clone();
        tokio::spawn(async move {
            inner.run(worker_task, request, cancel_rx).await;
        });

        Ok(task)
    }

    /// Cancel the active task for `key`
    ///
    /// Returns whether an active task was found. Idempotent.
    pub fn cancel(&self, key: &str) -> bool {
        let task = self.inner.in_flight.lock().get(key).cloned();
        match task {
            Some(task) if task.status().is_active() => {
                tracing::info!(key = %key, task_id = %task.id(), "Cancelling download");
                task.cancel();
                true
            }
            _ => false,
        }
    }

    /// Active task for `key`, if any
    #[must_use]
    pub fn task(&self, key: &str) -> Option<DownloadTask> {
        self.inner
            .in_flight
            .lock()
            .get(key)
            .filter(|t| t.status().is_active())
            .cloned()
    }

    /// All active tasks
    #[must_use]
    pub fn active_downloads(&self) -> Vec<DownloadTask> {
        self.inner
            .in_flight
            .lock()
            .values()
            .filter(|t| t.status().is_active())
            .cloned()
            .collect()
    }

    /// Progress stream of the active task for `key`
    #[must_use]
    pub fn observe(&self, key: &str) -> Option<BoxStream<'static, DownloadProgress>> {
        self.task(key).map(|task| task.subscribe())
    }
}

impl CoordinatorInner {
    async fn run(
        self: Arc<Self>,
        task: DownloadTask,
        request: DownloadRequest,
        mut cancel: watch::Receiver<bool>,
    ) {
        tracing::info!(
            key = %request.key,
            url = %request.url,
            task_id = %task.id(),
            "Download started"
        );

        let result = self.download(&task, &request, &mut cancel).await;

        match &result {
            Ok(outcome) => tracing::info!(
                key = %request.key,
                size_bytes = outcome.metadata.size_bytes,
                "Download completed"
            ),
            Err(CacheError::Cancelled(_)) => {
                tracing::info!(key = %request.key, "Download cancelled");
            }
            Err(e) => tracing::warn!(key = %request.key, error = %e, "Download failed"),
        }

        if result.is_err() {
            self.discard_partial(&request.key).await;
        }

        task.shared.finish(result);

        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(&request.key)
            .is_some_and(|current| current.id() == task.id())
        {
            in_flight.remove(&request.key);
        }
    }

    async fn download(
        &self,
        task: &DownloadTask,
        request: &DownloadRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> DownloadResult {
        let key = &request.key;

        // A task that finished just before this one was created
        if self.store.has_valid_entry(key).await {
            if let Some(metadata) = self.store.get_metadata(key).await? {
                tracing::debug!(key = %key, "Artifact already stored, skipping fetch");
                return Ok(PutOutcome {
                    metadata,
                    evicted: Vec::new(),
                });
            }
        }

        let partial = self.store.partial_download_path(key);
        let sidecar = self.store.partial_sidecar_path(key);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self
                .fetch_to_partial(task, request, &partial, &sidecar, cancel)
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_transient_network() && attempt < max_attempts => {
                    // Exponential backoff: base << (attempt - 1), capped
                    let exponent = (attempt - 1).min(16);
                    let delay_ms = self
                        .config
                        .retry_base_delay_ms
                        .saturating_mul(1u64 << exponent)
                        .min(self.config.retry_max_delay_ms);
                    tracing::warn!(
                        key = %key,
                        attempt,
                        max_attempts,
                        delay_ms,
                        error = %e,
                        "Download attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = wait_for_cancel(cancel) => return Err(CacheError::Cancelled(key.clone())),
                        () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let outcome = self
            .store
            .put_file(key, &partial, request.metadata())
            .await;
        let _ = tokio::fs::remove_file(&sidecar).await;
        outcome
    }

    async fn fetch_to_partial(
        &self,
        task: &DownloadTask,
        request: &DownloadRequest,
        partial: &Path,
        sidecar: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> CacheResult<()> {
        let key = &request.key;
        let offset = prepare_partial(&request.url, partial, sidecar).await?;
        let stall = Duration::from_secs(self.config.stall_timeout_secs);

        if let Some(expected) = request.expected_size_bytes {
            self.store
                .ensure_free_space(expected.saturating_sub(offset))
                .await?;
        }

        // The stall deadline also covers a server that never answers
        let response = tokio::select! {
            biased;
            () = wait_for_cancel(cancel) => return Err(CacheError::Cancelled(key.clone())),
            response = tokio::time::timeout(stall, self.fetcher.fetch(&request.url, offset)) => {
                response.map_err(|_| CacheError::Stalled {
                    key: key.clone(),
                    secs: self.config.stall_timeout_secs,
                })??
            }
        };

        if let (Some(expected), Some(total)) = (request.expected_size_bytes, response.total_len) {
            if expected != total {
                return Err(CacheError::SizeMismatch {
                    expected,
                    actual: total,
                });
            }
        }

        if let Some(total) = response.total_len {
            let already = if response.resumed { offset } else { 0 };
            self.store
                .ensure_free_space(total.saturating_sub(already))
                .await?;
        }

        let (file, mut downloaded) = if response.resumed && offset > 0 {
            tracing::info!(key = %key, offset, "Resuming partial download");
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(partial)
                .await?;
            (file, offset)
        } else {
            (tokio::fs::File::create(partial).await?, 0)
        };

        let total = response.total_len.or(request.expected_size_bytes);
        let mut writer = BufWriter::with_capacity(self.config.chunk_size_bytes.max(8 * 1024), file);
        let mut stream = response.stream;
        let started = Instant::now();
        let mut session_bytes: u64 = 0;

        task.shared.publish(DownloadProgress::measure(
            task.status(),
            downloaded,
            total,
            0,
            Duration::ZERO,
        ));

        loop {
            let next = tokio::select! {
                biased;
                () = wait_for_cancel(cancel) => return Err(CacheError::Cancelled(key.clone())),
                next = tokio::time::timeout(stall, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(CacheError::Stalled {
                        key: key.clone(),
                        secs: self.config.stall_timeout_secs,
                    });
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    // Keep what arrived so the retry can resume
                    writer.flush().await?;
                    return Err(e);
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            session_bytes += chunk.len() as u64;

            if let Some(expected) = request.expected_size_bytes {
                if downloaded > expected {
                    return Err(CacheError::SizeMismatch {
                        expected,
                        actual: downloaded,
                    });
                }
            }

            task.shared.publish(DownloadProgress::measure(
                DownloadStatus::Downloading,
                downloaded,
                total,
                session_bytes,
                started.elapsed(),
            ));
        }

        writer.flush().await?;
        writer.get_mut().sync_all().await?;
        Ok(())
    }

    async fn discard_partial(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.store.partial_download_path(key)).await;
        let _ = tokio::fs::remove_file(self.store.partial_sidecar_path(key)).await;
    }
}

/// Source of a partial download
#[derive(Debug, Serialize, Deserialize)]
struct PartialRecord {
    url: String,
}

/// Resume offset for `url`; a partial file from another source is dropped
async fn prepare_partial(url: &str, partial: &Path, sidecar: &Path) -> CacheResult<u64> {
    let existing = match tokio::fs::metadata(partial).await {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    if let Some(len) = existing {
        let recorded = tokio::fs::read(sidecar)
            .await
            .ok()
            .and_then(|raw| serde_json::from_slice::<PartialRecord>(&raw).ok());
        if recorded.is_some_and(|r| r.url == url) {
            return Ok(len);
        }
        tracing::debug!(url = %url, "Discarding partial download from a different source");
        tokio::fs::remove_file(partial).await?;
    }

    let record = serde_json::to_vec(&PartialRecord {
        url: url.to_string(),
    })?;
    tokio::fs::write(sidecar, record).await?;
    Ok(0)
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_checksum;
    use crate::store::StoreConfig;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    const URL: &str = "https://models.example.com/blob.bin";

    struct MockFetcher {
        body: Vec<u8>,
        chunk: usize,
        calls: AtomicUsize,
        offsets: Mutex<Vec<u64>>,
        /// Attempts that break with a network error after `fail_after` chunks
        failures: AtomicUsize,
        fail_after: usize,
        /// Stop sending (without closing) after this many chunks
        hang_after: Option<usize>,
        /// Never answer the request at all
        unresponsive: bool,
    }

    impl MockFetcher {
        fn new(body: Vec<u8>) -> Self {
            Self {
                body,
                chunk: 512,
                calls: AtomicUsize::new(0),
                offsets: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(0),
                fail_after: 0,
                hang_after: None,
                unresponsive: false,
            }
        }

        fn failing(mut self, attempts: usize, after_chunks: usize) -> Self {
            self.failures = AtomicUsize::new(attempts);
            self.fail_after = after_chunks;
            self
        }

        fn hanging(mut self, after_chunks: usize) -> Self {
            self.hang_after = Some(after_chunks);
            self
        }

        fn unresponsive(mut self) -> Self {
            self.unresponsive = true;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ArtifactFetcher for MockFetcher {
        async fn fetch(&self, _url: &str, offset: u64) -> CacheResult<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.offsets.lock().push(offset);
            if self.unresponsive {
                std::future::pending::<()>().await;
            }

            let start = (offset as usize).min(self.body.len());
            let mut chunks: Vec<CacheResult<Bytes>> = self.body[start..]
                .chunks(self.chunk)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();

            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                chunks.truncate(self.fail_after);
                chunks.push(Err(CacheError::Network("connection reset".into())));
            }

            let body = stream::iter(chunks);
            let stream = match self.hang_after {
                Some(n) => body.take(n).chain(stream::pending()).boxed(),
                None => body.boxed(),
            };

            Ok(FetchResponse {
                total_len: Some(self.body.len() as u64),
                resumed: offset > 0,
                stream,
            })
        }
    }

    fn fast_config() -> DownloadConfig {
        DownloadConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            ..DownloadConfig::default()
        }
    }

    async fn setup(fetcher: MockFetcher) -> (TempDir, Arc<ArtifactStore>, Arc<MockFetcher>, DownloadCoordinator) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::open(StoreConfig::new(dir.path())).await.unwrap());
        let fetcher = Arc::new(fetcher);
        let coordinator = DownloadCoordinator::new(store.clone(), fetcher.clone(), fast_config());
        (dir, store, fetcher, coordinator)
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_download_completes_with_progress() {
        let data = body(4096);
        let (_dir, store, fetcher, coordinator) = setup(MockFetcher::new(data.clone())).await;

        let request = DownloadRequest::new("k", URL)
            .with_checksum(compute_checksum(&data))
            .with_size(4096);
        let task = coordinator.start_download(request).unwrap();
        let updates: Vec<_> = task.subscribe().collect().await;

        let outcome = task.wait().await.unwrap();
        assert_eq!(outcome.metadata.size_bytes, 4096);
        assert_eq!(fetcher.calls(), 1);

        assert_eq!(updates.first().unwrap().status, DownloadStatus::Pending);
        assert!(updates.iter().any(|p| p.status == DownloadStatus::Downloading));
        let last = updates.last().unwrap();
        assert_eq!(last.status, DownloadStatus::Completed);
        assert_eq!(last.bytes_downloaded, 4096);
        assert!(updates
            .windows(2)
            .all(|w| w[0].bytes_downloaded <= w[1].bytes_downloaded));

        let (_, bytes) = store.get("k").await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), data.as_slice());
        assert!(coordinator.active_downloads().is_empty());
        assert!(tokio::fs::metadata(store.partial_download_path("k")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_start_joins_existing_task() {
        let (_dir, _store, fetcher, coordinator) = setup(MockFetcher::new(body(2048))).await;

        let first = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        let second = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(coordinator.active_downloads().len(), 1);

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_terminal_creates_fresh_task() {
        let (_dir, _store, fetcher, coordinator) = setup(MockFetcher::new(body(1024))).await;

        let first = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        first.wait().await.unwrap();
        assert!(coordinator.task("k").is_none());

        let second = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        assert_ne!(first.id(), second.id());
        second.wait().await.unwrap();
        // Already stored, nothing refetched
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_and_resumes() {
        let data = body(4096);
        let (_dir, store, fetcher, coordinator) =
            setup(MockFetcher::new(data.clone()).failing(1, 2)).await;

        let task = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        task.wait().await.unwrap();

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(*fetcher.offsets.lock(), vec![0, 1024]);
        let (_, bytes) = store.get("k").await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails() {
        let (_dir, store, fetcher, coordinator) =
            setup(MockFetcher::new(body(2048)).failing(10, 1)).await;

        let task = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        let err = task.wait().await.unwrap_err();

        assert!(matches!(err, CacheError::Network(_)));
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(task.status(), DownloadStatus::Failed);
        assert!(store.get("k").await.unwrap().is_none());
        assert!(tokio::fs::metadata(store.partial_download_path("k")).await.is_err());
    }

    #[tokio::test]
    async fn test_checksum_failure_not_retried() {
        let (_dir, store, fetcher, coordinator) = setup(MockFetcher::new(body(2048))).await;

        let request = DownloadRequest::new("k", URL).with_checksum("ab".repeat(32));
        let task = coordinator.start_download(request).unwrap();
        let err = task.wait().await.unwrap_err();

        assert!(matches!(err, CacheError::ChecksumMismatch { .. }));
        assert_eq!(fetcher.calls(), 1);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reported_length_mismatch_fails_early() {
        let (_dir, _store, fetcher, coordinator) = setup(MockFetcher::new(body(2048))).await;

        let task = coordinator
            .start_download(DownloadRequest::new("k", URL).with_size(10))
            .unwrap();
        let err = task.wait().await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::SizeMismatch {
                expected: 10,
                actual: 2048
            }
        ));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_discards_partial() {
        let (_dir, store, _fetcher, coordinator) =
            setup(MockFetcher::new(body(4096)).hanging(2)).await;

        let task = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        let mut updates = task.subscribe();
        while let Some(progress) = updates.next().await {
            if progress.bytes_downloaded >= 1024 {
                break;
            }
        }

        assert!(coordinator.cancel("k"));
        let err = task.wait().await.unwrap_err();
        assert!(matches!(err, CacheError::Cancelled(_)));
        assert_eq!(task.status(), DownloadStatus::Cancelled);
        assert!(!coordinator.cancel("k"));
        assert!(tokio::fs::metadata(store.partial_download_path("k")).await.is_err());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stall_timeout_fails_task() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::open(StoreConfig::new(dir.path())).await.unwrap());
        let fetcher = Arc::new(MockFetcher::new(body(4096)).hanging(1));
        let config = DownloadConfig {
            stall_timeout_secs: 1,
            ..fast_config()
        };
        let coordinator = DownloadCoordinator::new(store.clone(), fetcher.clone(), config);

        let task = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        let err = task.wait().await.unwrap_err();

        assert!(matches!(err, CacheError::Stalled { secs: 1, .. }));
        assert_eq!(task.status(), DownloadStatus::Failed);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_unanswered_request_stalls() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::open(StoreConfig::new(dir.path())).await.unwrap());
        let fetcher = Arc::new(MockFetcher::new(body(4096)).unresponsive());
        let config = DownloadConfig {
            stall_timeout_secs: 1,
            ..fast_config()
        };
        let coordinator = DownloadCoordinator::new(store.clone(), fetcher.clone(), config);

        let task = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(10), task.wait())
            .await
            .expect("stall deadline should end the task")
            .unwrap_err();

        assert!(matches!(err, CacheError::Stalled { secs: 1, .. }));
        assert_eq!(task.status(), DownloadStatus::Failed);
        assert_eq!(fetcher.calls(), 1);
        assert!(coordinator.active_downloads().is_empty());
    }

    async fn setup_without_free_space(
        fetcher: MockFetcher,
    ) -> (TempDir, Arc<ArtifactStore>, Arc<MockFetcher>, DownloadCoordinator) {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::new(dir.path());
        config.min_free_space_bytes = u64::MAX;
        let store = Arc::new(ArtifactStore::open(config).await.unwrap());
        let fetcher = Arc::new(fetcher);
        let coordinator = DownloadCoordinator::new(store.clone(), fetcher.clone(), fast_config());
        (dir, store, fetcher, coordinator)
    }

    #[tokio::test]
    async fn test_declared_size_without_free_space_fails_before_fetch() {
        let (_dir, store, fetcher, coordinator) =
            setup_without_free_space(MockFetcher::new(body(2048))).await;

        let task = coordinator
            .start_download(DownloadRequest::new("k", URL).with_size(2048))
            .unwrap();
        let err = task.wait().await.unwrap_err();

        assert!(matches!(err, CacheError::InsufficientStorage { required: 2048, .. }));
        assert_eq!(task.status(), DownloadStatus::Failed);
        assert_eq!(fetcher.calls(), 0);
        assert!(tokio::fs::metadata(store.partial_download_path("k")).await.is_err());
    }

    #[tokio::test]
    async fn test_reported_size_without_free_space_fails_before_writing() {
        let (_dir, store, fetcher, coordinator) =
            setup_without_free_space(MockFetcher::new(body(2048))).await;

        let task = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        let err = task.wait().await.unwrap_err();

        assert!(matches!(err, CacheError::InsufficientStorage { required: 2048, .. }));
        // Not a network error: no retry
        assert_eq!(fetcher.calls(), 1);
        assert!(tokio::fs::metadata(store.partial_download_path("k")).await.is_err());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resumes_partial_from_previous_run() {
        let data = body(4096);
        let (_dir, store, fetcher, coordinator) = setup(MockFetcher::new(data.clone())).await;

        tokio::fs::write(store.partial_download_path("k"), &data[..1500])
            .await
            .unwrap();
        let sidecar = serde_json::to_vec(&PartialRecord { url: URL.into() }).unwrap();
        tokio::fs::write(store.partial_sidecar_path("k"), sidecar)
            .await
            .unwrap();

        let task = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        task.wait().await.unwrap();

        assert_eq!(*fetcher.offsets.lock(), vec![1500]);
        let (_, bytes) = store.get("k").await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_partial_from_other_source_is_discarded() {
        let data = body(2048);
        let (_dir, store, fetcher, coordinator) = setup(MockFetcher::new(data.clone())).await;

        tokio::fs::write(store.partial_download_path("k"), b"stale bytes")
            .await
            .unwrap();
        let sidecar = serde_json::to_vec(&PartialRecord {
            url: "https://elsewhere.example.com/old.bin".into(),
        })
        .unwrap();
        tokio::fs::write(store.partial_sidecar_path("k"), sidecar)
            .await
            .unwrap();

        let task = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        task.wait().await.unwrap();

        assert_eq!(*fetcher.offsets.lock(), vec![0]);
        let (_, bytes) = store.get("k").await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_subscribe_after_finish_yields_final_snapshot() {
        let (_dir, _store, _fetcher, coordinator) = setup(MockFetcher::new(body(512))).await;
        let task = coordinator.start_download(DownloadRequest::new("k", URL)).unwrap();
        task.wait().await.unwrap();

        let updates: Vec<_> = task.subscribe().collect().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, DownloadStatus::Completed);
        assert!(coordinator.observe("k").is_none());
    }

    #[test]
    fn test_progress_math() {
        let progress = DownloadProgress::measure(
            DownloadStatus::Downloading,
            250,
            Some(1000),
            250,
            Duration::from_secs(1),
        );
        assert_eq!(progress.percentage, Some(25.0));
        assert_eq!(progress.speed_bytes_per_sec, 250.0);
        assert_eq!(progress.eta_millis, Some(3000));

        let unknown = DownloadProgress::measure(
            DownloadStatus::Downloading,
            10,
            None,
            10,
            Duration::from_secs(1),
        );
        assert_eq!(unknown.percentage, None);
        assert_eq!(unknown.eta_millis, None);
    }

    #[test]
    fn test_status_classification() {
        assert!(DownloadStatus::Pending.is_active());
        assert!(DownloadStatus::Downloading.is_active());
        for status in [
            DownloadStatus::Completed,
            DownloadStatus::Failed,
            DownloadStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
        assert_eq!(DownloadStatus::Downloading.to_string(), "downloading");
    }
}
