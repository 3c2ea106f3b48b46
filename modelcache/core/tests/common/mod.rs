//! Shared fixtures for integration tests
//!
//! [`TestFetcher`] stands in for an HTTP server: it serves one body, honours
//! resume offsets, counts requests and can be held at a gate or made to fail.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;

use modelcache_core::{
    ArtifactFetcher, ArtifactRegistry, CacheConfig, CacheError, CacheResult, FetchResponse,
};

pub const URL: &str = "https://models.example.com/artifact";

/// In-process artifact server
pub struct TestFetcher {
    body: Vec<u8>,
    chunk: usize,
    calls: AtomicUsize,
    offsets: Mutex<Vec<u64>>,
    started: watch::Sender<usize>,
    gate: watch::Sender<bool>,
    gated: bool,
    failures: AtomicUsize,
    fail_after_chunks: usize,
    unresponsive: bool,
}

impl TestFetcher {
    pub fn new(body: Vec<u8>) -> Self {
        let (started, _) = watch::channel(0);
        let (gate, _) = watch::channel(false);
        Self {
            body,
            chunk: 4096,
            calls: AtomicUsize::new(0),
            offsets: Mutex::new(Vec::new()),
            started,
            gate,
            gated: false,
            failures: AtomicUsize::new(0),
            fail_after_chunks: 0,
            unresponsive: false,
        }
    }

    /// Hold every response until [`TestFetcher::release`]
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    /// Break the first `attempts` responses after `after_chunks` chunks
    pub fn failing(mut self, attempts: usize, after_chunks: usize) -> Self {
        self.failures = AtomicUsize::new(attempts);
        self.fail_after_chunks = after_chunks;
        self
    }

    /// Accept requests but never answer them
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().clone()
    }

    /// Resolves once at least `n` requests have arrived
    pub async fn wait_for_requests(&self, n: usize) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl ArtifactFetcher for TestFetcher {
    async fn fetch(&self, _url: &str, offset: u64) -> CacheResult<FetchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.offsets.lock().push(offset);
        self.started.send_modify(|count| *count += 1);

        if self.unresponsive {
            std::future::pending::<()>().await;
        }
        if self.gated {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
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
            chunks.truncate(self.fail_after_chunks);
            chunks.push(Err(CacheError::Network("connection reset by peer".into())));
        }

        Ok(FetchResponse {
            total_len: Some(self.body.len() as u64),
            resumed: offset > 0,
            stream: stream::iter(chunks).boxed(),
        })
    }
}

/// Deterministic payload that is not mistaken for any known format
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 253) as u8).collect()
}

/// Payload starting with the GGUF magic
pub fn gguf_payload(len: usize) -> Vec<u8> {
    let mut bytes = b"GGUF\x03\x00\x00\x00".to_vec();
    bytes.extend(payload(len.saturating_sub(8)));
    bytes
}

pub fn test_config(dir: &TempDir) -> CacheConfig {
    let mut config = CacheConfig::with_root(dir.path());
    config.memory.max_memory_bytes = 16 * 1024 * 1024;
    config.download.retry_base_delay_ms = 1;
    config.download.retry_max_delay_ms = 10;
    config
}

pub async fn registry_with(
    config: &CacheConfig,
    fetcher: TestFetcher,
) -> (Arc<TestFetcher>, Arc<ArtifactRegistry>) {
    let fetcher = Arc::new(fetcher);
    let registry = ArtifactRegistry::open_with_fetcher(config, fetcher.clone())
        .await
        .unwrap();
    (fetcher, Arc::new(registry))
}
