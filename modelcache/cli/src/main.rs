//! modelcache - Command-line front end for the artifact registry
//!
//! Builds one [`ArtifactRegistry`] from layered configuration and runs a
//! single command against it.
//!
//! # Usage
//!
//! ```bash
//! # Download (or serve from cache) a model
//! modelcache resolve tinyllama --url https://example.com/tinyllama.gguf --format gguf
//!
//! # Start a download and report the task result
//! modelcache prefetch whisper-tiny --url https://example.com/whisper-tiny.onnx
//!
//! # Inspect the cache
//! modelcache list
//! modelcache stats
//!
//! # Drop an artifact from every tier
//! modelcache invalidate tinyllama
//!
//! # Verbose logging
//! RUST_LOG=debug modelcache list
//! ```
//!
//! # Signals
//!
//! - `SIGINT` during a download: cancel it and exit

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{info, warn};

use modelcache_core::{
    load_config_from_path, ArtifactFormat, ArtifactMetadata, ArtifactRegistry, CacheConfig,
    ConfigOverrides, DownloadProgress, DownloadStatus, SourceDescriptor,
};

/// modelcache - Durable cache for on-device model artifacts
#[derive(Parser, Debug)]
#[command(name = "modelcache")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "MODELCACHE_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Cache root directory
    #[arg(long, value_name = "DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// Memory tier budget in bytes
    #[arg(long, value_name = "BYTES", global = true)]
    memory_budget: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "MODELCACHE_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a key to bytes, downloading it if needed
    Resolve {
        /// Artifact key
        key: String,

        #[command(flatten)]
        source: SourceArgs,

        /// Give up waiting after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Download an artifact in the background of this process and report the result
    Prefetch {
        /// Artifact key
        key: String,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// List cached artifacts, most recently used first
    List,

    /// Show cache usage
    Stats,

    /// Remove an artifact from every tier
    Invalidate {
        /// Artifact key
        key: String,
    },
}

/// Where to fetch an artifact from and what to expect
#[derive(ClapArgs, Debug, Default)]
struct SourceArgs {
    /// Remote URL
    #[arg(long)]
    url: Option<String>,

    /// Expected SHA-256 digest (hex)
    #[arg(long, value_name = "HEX")]
    sha256: Option<String>,

    /// Expected size in bytes
    #[arg(long, value_name = "BYTES")]
    size: Option<u64>,

    /// Declared format (onnx, gguf, safetensors, tflite, mlpackage)
    #[arg(long)]
    format: Option<ArtifactFormat>,

    /// Display name
    #[arg(long)]
    name: Option<String>,
}

impl SourceArgs {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            url: self.url.clone(),
            expected_checksum: self.sha256.clone(),
            expected_size_bytes: self.size,
            declared_format: self.format,
            display_name: self.name.clone(),
        }
    }
}

/// Initialize logging with the specified level
///
/// Logs go to stderr; stdout carries command output.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("modelcache={level},modelcache_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn build_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(Some(path.as_path())).await,
        None => modelcache_core::load_config().await,
    }
    .context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(dir) = &args.cache_dir {
        overrides = overrides.with_root(dir.clone());
    }
    if let Some(bytes) = args.memory_budget {
        overrides = overrides.with_max_memory_bytes(bytes);
    }
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        root = %config.store.root.display(),
        source = %config.source(),
        "Configuration loaded"
    );
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = build_config(&args).await?;
    let registry = ArtifactRegistry::open(&config)
        .await
        .with_context(|| format!("Failed to open cache at {}", config.store.root.display()))?;

    match args.command {
        Command::Resolve {
            key,
            source,
            timeout,
        } => resolve(&registry, &key, &source.descriptor(), timeout).await,
        Command::Prefetch { key, source } => prefetch(&registry, &key, &source.descriptor()).await,
        Command::List => list(&registry).await,
        Command::Stats => stats(&registry).await,
        Command::Invalidate { key } => {
            registry
                .invalidate(&key)
                .await
                .with_context(|| format!("Failed to invalidate {key}"))?;
            println!("invalidated {key}");
            Ok(())
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn resolve(
    registry: &ArtifactRegistry,
    key: &str,
    source: &SourceDescriptor,
    timeout: Option<u64>,
) -> Result<()> {
    // Start the download up front so its progress can be shown; resolve
    // joins the same task
    let progress = if source.url.is_some() {
        registry
            .prefetch(key, source)
            .await
            .with_context(|| format!("Failed to start download of {key}"))?
            .map(|task| tokio::spawn(print_progress(task.subscribe())))
    } else {
        None
    };

    let resolving = async {
        match timeout {
            Some(secs) => {
                registry
                    .resolve_with_timeout(key, source, Duration::from_secs(secs))
                    .await
            }
            None => registry.resolve(key, source).await,
        }
    };

    let bytes = tokio::select! {
        result = resolving => result.with_context(|| format!("Failed to resolve {key}"))?,
        _ = tokio::signal::ctrl_c() => {
            if let Some(task) = registry.downloads().task(key) {
                task.cancel();
                let _ = task.wait().await;
                warn!(key = %key, "Interrupted, download cancelled");
            }
            anyhow::bail!("Interrupted while resolving {key}");
        }
    };

    if let Some(handle) = progress {
        let _ = handle.await;
    }

    let metadata = registry
        .store()
        .get_metadata(key)
        .await
        .context("Failed to read artifact metadata")?;
    match metadata {
        Some(meta) => print_metadata(&meta),
        None => println!("{key}\t{}", human_bytes(bytes.len() as u64)),
    }
    Ok(())
}

async fn prefetch(registry: &ArtifactRegistry, key: &str, source: &SourceDescriptor) -> Result<()> {
    let Some(task) = registry
        .prefetch(key, source)
        .await
        .with_context(|| format!("Failed to start download of {key}"))?
    else {
        println!("{key} already cached");
        return Ok(());
    };

    let printer = tokio::spawn(print_progress(task.subscribe()));
    let outcome = tokio::select! {
        outcome = task.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            task.cancel();
            warn!(key = %key, "Interrupted, download cancelled");
            task.wait().await
        }
    };
    let _ = printer.await;

    let outcome = outcome.with_context(|| format!("Download of {key} failed"))?;
    for evicted in &outcome.evicted {
        println!("evicted {evicted}");
    }
    print_metadata(&outcome.metadata);
    Ok(())
}

async fn list(registry: &ArtifactRegistry) -> Result<()> {
    let entries = registry
        .cached_artifacts()
        .await
        .context("Failed to list cached artifacts")?;
    if entries.is_empty() {
        println!("cache is empty");
        return Ok(());
    }
    println!("{:<32} {:>10} {:<12} {:<20} SOURCE", "KEY", "SIZE", "FORMAT", "LAST USED");
    for meta in entries {
        println!(
            "{:<32} {:>10} {:<12} {:<20} {}",
            meta.key,
            human_bytes(meta.size_bytes),
            meta.detected_format.to_string(),
            meta.last_accessed_at.format("%Y-%m-%d %H:%M:%S"),
            meta.source_url.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn stats(registry: &ArtifactRegistry) -> Result<()> {
    let stats = registry.stats().await.context("Failed to collect stats")?;
    let root = registry.store().root().display().to_string();
    let free = registry.store().available_space().await.ok();

    println!("root:             {root}");
    println!(
        "durable:          {} in {} entries",
        human_bytes(stats.durable_bytes),
        stats.entry_count
    );
    if let Some(free) = free {
        println!("free space:       {}", human_bytes(free));
    }
    println!(
        "memory budget:    {}",
        human_bytes(stats.memory.max_bytes)
    );
    println!("active downloads: {}", stats.active_downloads);
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

async fn print_progress(mut updates: BoxStream<'static, DownloadProgress>) {
    while let Some(p) = updates.next().await {
        match p.status {
            DownloadStatus::Pending => {}
            DownloadStatus::Downloading => {
                let total = p.total_bytes.map_or_else(|| "?".to_string(), human_bytes);
                let pct = p.percentage.map_or_else(String::new, |pct| format!(" ({pct:.1}%)"));
                let eta = p
                    .eta_millis
                    .map_or_else(String::new, |ms| format!(" eta {}s", ms.div_ceil(1000)));
                eprintln!(
                    "downloading {} / {total}{pct} at {}/s{eta}",
                    human_bytes(p.bytes_downloaded),
                    human_bytes(p.speed_bytes_per_sec as u64),
                );
            }
            status => eprintln!("{status}: {}", human_bytes(p.bytes_downloaded)),
        }
    }
}

fn print_metadata(meta: &ArtifactMetadata) {
    println!("key:      {}", meta.key);
    println!("name:     {}", meta.display_name);
    println!("size:     {} ({} bytes)", human_bytes(meta.size_bytes), meta.size_bytes);
    println!("format:   {}", meta.detected_format);
    if let Some(checksum) = &meta.checksum {
        println!("sha256:   {checksum}");
    }
    if let Some(url) = &meta.source_url {
        println!("source:   {url}");
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
