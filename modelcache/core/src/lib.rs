//! modelcache Core - Durable Artifact Cache for On-Device Models
//!
//! Resolves a logical model key (e.g. `whisper-tiny`) to the bytes of a
//! large, immutable model file, keeping hot artifacts in memory, everything
//! else on disk, and fetching from a remote source at most once per key.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ArtifactRegistry                        │
//! │            resolve / prefetch / invalidate / stats           │
//! │                                                              │
//! │  ┌────────────┐   ┌───────────────┐   ┌───────────────────┐  │
//! │  │ MemoryTier │   │ ArtifactStore │◄──│DownloadCoordinator│  │
//! │  │  (LRU,     │   │ (staging +    │   │ (single-flight,   │  │
//! │  │  budgeted) │   │  atomic       │   │  resume, retry)   │  │
//! │  └────────────┘   │  promotion)   │   └─────────┬─────────┘  │
//! │                   └───────┬───────┘             │            │
//! │                           │             ArtifactFetcher      │
//! │               checksum ◄──┴──► format     (HTTP / custom)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ArtifactRegistry`]: The façade; owns one of each tier
//! - [`ArtifactStore`]: Crash-consistent durable storage
//! - [`MemoryTier`]: Disposable in-memory LRU copy of hot artifacts
//! - [`DownloadCoordinator`]: At most one fetch per key, with progress
//! - [`CacheError`]: Every failure kind, preserved across layers
//!
//! # Quick Start
//!
//! ```ignore
//! use modelcache_core::{load_config, ArtifactRegistry, SourceDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config().await?;
//!     let registry = ArtifactRegistry::open(&config).await?;
//!
//!     let source = SourceDescriptor::from_url("https://example.com/tinyllama.gguf")
//!         .with_size(669_000_000);
//!     let bytes = registry.resolve("tinyllama-1.1b", &source).await?;
//!     println!("{} bytes", bytes.len());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`checksum`]: Streaming SHA-256 digests
//! - [`format`]: Container format detection (magic bytes, sentinels, extension)
//! - [`metadata`]: Artifact metadata records and key helpers
//! - [`store`]: Durable artifact store
//! - [`memory`]: In-memory LRU tier
//! - [`download`]: Download coordinator and transport seam
//! - [`registry`]: The resolve façade
//! - [`config`]: Layered TOML / environment / CLI configuration
//! - [`error`]: Error taxonomy

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checksum;
pub mod config;
pub mod download;
pub mod error;
pub mod format;
pub mod memory;
pub mod metadata;
pub mod registry;
pub mod store;

pub use checksum::{checksum_file, compute_checksum, verify, ChecksumAlgorithm, StreamingHasher};
pub use config::{
    default_config_path, load_config, load_config_from_path, CacheConfig, CacheToml, ConfigError,
    ConfigOverrides, ConfigSource,
};
pub use download::{
    ArtifactFetcher, DownloadConfig, DownloadCoordinator, DownloadOutcome, DownloadProgress,
    DownloadRequest, DownloadResult, DownloadStatus, DownloadTask, FetchResponse, HttpFetcher,
};
pub use error::{CacheError, CacheResult};
pub use format::{detect_format, detect_path, ArtifactFormat};
pub use memory::{MemoryConfig, MemoryStats, MemoryTier};
pub use metadata::{ArtifactBytes, ArtifactMetadata};
pub use registry::{ArtifactRegistry, RegistryStats, SourceDescriptor};
pub use store::{ArtifactStore, FormatPolicy, PutOutcome, RecoveryReport, StoreConfig};
