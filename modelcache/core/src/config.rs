//! TOML Configuration File Support
//!
//! Centralized configuration for the cache, loaded from
//! `$XDG_CONFIG_HOME/modelcache/modelcache.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`MODELCACHE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [store]
//! root = "/var/cache/modelcache"
//! max_storage_bytes = 21474836480
//! min_free_space_bytes = 1073741824
//! verify_checksum_on_read = false
//! format_policy = "strict"
//!
//! [memory]
//! max_memory_bytes = 536870912
//!
//! [download]
//! max_attempts = 3
//! retry_base_delay_ms = 500
//! retry_max_delay_ms = 10000
//! stall_timeout_secs = 30
//! connect_timeout_secs = 30
//! chunk_size_bytes = 1048576
//! user_agent = "modelcache/0.1"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::DownloadConfig;
use crate::memory::MemoryConfig;
use crate::store::{FormatPolicy, StoreConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Store section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Cache root directory
    pub root: Option<PathBuf>,

    /// Durable storage quota in bytes
    pub max_storage_bytes: Option<u64>,

    /// Free disk space writes must leave untouched
    pub min_free_space_bytes: Option<u64>,

    /// Re-hash blobs on every read
    pub verify_checksum_on_read: Option<bool>,

    /// `strict` or `warn`
    pub format_policy: Option<FormatPolicy>,
}

/// Memory section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryToml {
    /// In-memory tier budget in bytes
    pub max_memory_bytes: Option<u64>,
}

/// Download section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadToml {
    /// Total attempts per download
    pub max_attempts: Option<u32>,

    /// First retry delay in milliseconds
    pub retry_base_delay_ms: Option<u64>,

    /// Retry delay cap in milliseconds
    pub retry_max_delay_ms: Option<u64>,

    /// Seconds without a chunk before a download fails
    pub stall_timeout_secs: Option<u64>,

    /// HTTP connect timeout in seconds
    pub connect_timeout_secs: Option<u64>,

    /// Write buffer size in bytes
    pub chunk_size_bytes: Option<usize>,

    /// HTTP User-Agent
    pub user_agent: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Store configuration section
    pub store: StoreToml,

    /// Memory configuration section
    pub memory: MemoryToml,

    /// Download configuration section
    pub download: DownloadToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Complete cache configuration
///
/// Use [`load_config`] to load it with proper priority handling.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    /// Durable store settings
    pub store: StoreConfig,

    /// Memory tier settings
    pub memory: MemoryConfig,

    /// Download settings
    pub download: DownloadConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: Option<ConfigSource>,
}

impl CacheConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::new(root),
            ..Self::default()
        }
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source.unwrap_or(ConfigSource::Default)
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = Some(source);
    }

    /// Reject settings the cache cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "store.root must not be empty".into(),
            ));
        }
        if self.memory.max_memory_bytes == 0 && self.store.max_storage_bytes == Some(0) {
            return Err(ConfigError::ValidationError(
                "memory.max_memory_bytes and store.max_storage_bytes are both zero; nothing could be cached"
                    .into(),
            ));
        }
        if self.store.max_storage_bytes == Some(0) {
            return Err(ConfigError::ValidationError(
                "store.max_storage_bytes must be greater than zero".into(),
            ));
        }
        if self.download.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "download.max_attempts must be at least 1".into(),
            ));
        }
        if self.download.stall_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "download.stall_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.download.retry_base_delay_ms > self.download.retry_max_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "download.retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.download.retry_base_delay_ms, self.download.retry_max_delay_ms
            )));
        }
        if self.download.chunk_size_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "download.chunk_size_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/modelcache/modelcache.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("modelcache").join("modelcache.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI overrides are not handled here; apply [`ConfigOverrides`] afterwards.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged configuration fails validation. A missing config file is not
/// an error (defaults are used).
pub async fn load_config() -> Result<CacheConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref()).await
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub async fn load_config_from_path(path: Option<&Path>) -> Result<CacheConfig, ConfigError> {
    let mut config = CacheConfig::default();

    if let Some(config_path) = path {
        match tokio::fs::read_to_string(config_path).await {
            Ok(toml_content) => {
                let toml_config: CacheToml = toml::from_str(&toml_content)?;
                apply_toml_config(&mut config, &toml_config);
                config.config_file_path = Some(config_path.to_path_buf());
                config.set_source(ConfigSource::File);

                tracing::info!(
                    path = %config_path.display(),
                    "Loaded configuration from file"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    path = %config_path.display(),
                    "Config file not found, using defaults"
                );
            }
            Err(e) => {
                return Err(ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                });
            }
        }
    }

    apply_env_config(&mut config, |name| std::env::var(name).ok());
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut CacheConfig, toml: &CacheToml) {
    // Store settings
    if let Some(root) = &toml.store.root {
        config.store.root = root.clone();
    }
    if toml.store.max_storage_bytes.is_some() {
        config.store.max_storage_bytes = toml.store.max_storage_bytes;
    }
    if let Some(bytes) = toml.store.min_free_space_bytes {
        config.store.min_free_space_bytes = bytes;
    }
    if let Some(verify) = toml.store.verify_checksum_on_read {
        config.store.verify_checksum_on_read = verify;
    }
    if let Some(policy) = toml.store.format_policy {
        config.store.format_policy = policy;
    }

    // Memory settings
    if let Some(bytes) = toml.memory.max_memory_bytes {
        config.memory.max_memory_bytes = bytes;
    }

    // Download settings
    if let Some(attempts) = toml.download.max_attempts {
        config.download.max_attempts = attempts;
    }
    if let Some(ms) = toml.download.retry_base_delay_ms {
        config.download.retry_base_delay_ms = ms;
    }
    if let Some(ms) = toml.download.retry_max_delay_ms {
        config.download.retry_max_delay_ms = ms;
    }
    if let Some(secs) = toml.download.stall_timeout_secs {
        config.download.stall_timeout_secs = secs;
    }
    if let Some(secs) = toml.download.connect_timeout_secs {
        config.download.connect_timeout_secs = secs;
    }
    if let Some(size) = toml.download.chunk_size_bytes {
        config.download.chunk_size_bytes = size;
    }
    if let Some(agent) = &toml.download.user_agent {
        config.download.user_agent = agent.clone();
    }
}

/// Apply `MODELCACHE_*` overrides using `lookup` to read variables
fn apply_env_config(config: &mut CacheConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(root) = lookup("MODELCACHE_ROOT") {
        config.store.root = PathBuf::from(root);
        config.set_source(ConfigSource::Env);
    }
    if let Some(quota) = lookup("MODELCACHE_MAX_STORAGE_BYTES") {
        if let Ok(bytes) = quota.parse::<u64>() {
            config.store.max_storage_bytes = Some(bytes);
            config.set_source(ConfigSource::Env);
        }
    }
    if let Some(reserve) = lookup("MODELCACHE_MIN_FREE_SPACE_BYTES") {
        if let Ok(bytes) = reserve.parse::<u64>() {
            config.store.min_free_space_bytes = bytes;
            config.set_source(ConfigSource::Env);
        }
    }
    if let Some(verify) = lookup("MODELCACHE_VERIFY_ON_READ") {
        config.store.verify_checksum_on_read =
            verify != "0" && !verify.eq_ignore_ascii_case("false");
        config.set_source(ConfigSource::Env);
    }
    if let Some(policy) = lookup("MODELCACHE_FORMAT_POLICY") {
        if let Ok(policy) = policy.parse::<FormatPolicy>() {
            config.store.format_policy = policy;
            config.set_source(ConfigSource::Env);
        }
    }
    if let Some(budget) = lookup("MODELCACHE_MEMORY_BUDGET") {
        if let Ok(bytes) = budget.parse::<u64>() {
            config.memory.max_memory_bytes = bytes;
            config.set_source(ConfigSource::Env);
        }
    }
    if let Some(attempts) = lookup("MODELCACHE_MAX_ATTEMPTS") {
        if let Ok(n) = attempts.parse::<u32>() {
            config.download.max_attempts = n;
            config.set_source(ConfigSource::Env);
        }
    }
    if let Some(stall) = lookup("MODELCACHE_STALL_TIMEOUT") {
        if let Ok(secs) = stall.parse::<u64>() {
            config.download.stall_timeout_secs = secs;
            config.set_source(ConfigSource::Env);
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Cache root override
    pub root: Option<PathBuf>,

    /// Memory budget override
    pub max_memory_bytes: Option<u64>,

    /// Storage quota override
    pub max_storage_bytes: Option<u64>,

    /// Stall timeout override (seconds)
    pub stall_timeout_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set cache root override
    #[must_use]
    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = Some(root);
        self
    }

    /// Set memory budget override
    #[must_use]
    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Set storage quota override
    #[must_use]
    pub fn with_max_storage_bytes(mut self, bytes: u64) -> Self {
        self.max_storage_bytes = Some(bytes);
        self
    }

    /// Set stall timeout override
    #[must_use]
    pub fn with_stall_timeout_secs(mut self, secs: u64) -> Self {
        self.stall_timeout_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut CacheConfig) {
        if self.root.is_some()
            || self.max_memory_bytes.is_some()
            || self.max_storage_bytes.is_some()
            || self.stall_timeout_secs.is_some()
        {
            config.set_source(ConfigSource::Cli);
        }

        if let Some(root) = &self.root {
            config.store.root = root.clone();
        }
        if let Some(bytes) = self.max_memory_bytes {
            config.memory.max_memory_bytes = bytes;
        }
        if self.max_storage_bytes.is_some() {
            config.store.max_storage_bytes = self.max_storage_bytes;
        }
        if let Some(secs) = self.stall_timeout_secs {
            config.download.stall_timeout_secs = secs;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
