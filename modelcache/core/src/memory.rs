//! In-Memory Artifact Tier with LRU eviction
//!
//! A byte-budgeted cache of hot artifacts sitting above the durable store.
//! Every entry is a disposable copy: dropping it (or the whole tier) only
//! costs a re-read from disk, never correctness.
//!
//! # Design
//!
//! - **Memory Budget**: `max_memory_bytes` bounds the sum of cached payloads
//! - **Oversize Artifacts**: a single artifact larger than the budget is never
//!   cached; it is always served from the durable store
//! - **LRU Eviction**: each access stamps the entry with a monotonically
//!   increasing recency tick. Eviction removes the lowest tick first, so
//!   entries that were never read after a batch insert leave in insertion
//!   order.
//! - **Locking**: one `parking_lot::Mutex` held only for the map mutation;
//!   no operation here suspends.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::metadata::ArtifactBytes;

/// Default memory budget: 512 MiB
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * 1024 * 1024;

/// Memory tier configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Upper bound on cached payload bytes
    pub max_memory_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
        }
    }
}

/// A cached artifact copy
#[derive(Debug, Clone)]
struct MemoryEntry {
    bytes: ArtifactBytes,
    size_bytes: u64,
    last_accessed: Instant,
    recency: u64,
}

#[derive(Debug, Default)]
struct TierState {
    entries: HashMap<String, MemoryEntry>,
    /// Recency tick -> key, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    current_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejected: u64,
}

impl TierState {
    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.recency);
        self.current_bytes = self.current_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<(String, MemoryEntry)> {
        let (_, key) = self.order.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.current_bytes = self.current_bytes.saturating_sub(entry.size_bytes);
        Some((key, entry))
    }
}

/// Memory tier statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryStats {
    /// Bytes currently cached
    pub current_bytes: u64,
    /// Configured budget
    pub max_bytes: u64,
    /// Number of cached artifacts
    pub entry_count: usize,
    /// Lookups served from memory
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Inserts refused because the artifact exceeds the whole budget
    pub rejected: u64,
}

/// Bounded LRU cache of artifact bytes
#[derive(Debug)]
pub struct MemoryTier {
    max_bytes: u64,
    state: Mutex<TierState>,
}

impl MemoryTier {
    /// Create a tier with the given byte budget
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(TierState::default()),
        }
    }

    /// Create a tier from configuration
    #[must_use]
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.max_memory_bytes)
    }

    /// Look up an artifact, marking it most recently used
    pub fn get(&self, key: &str) -> Option<ArtifactBytes> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let tick = state.tick();

        let Some(entry) = state.entries.get_mut(key) else {
            state.misses += 1;
            return None;
        };
        let previous = entry.recency;
        entry.recency = tick;
        entry.last_accessed = Instant::now();
        let bytes = entry.bytes.clone();

        state.order.remove(&previous);
        state.order.insert(tick, key.to_string());
        state.hits += 1;
        Some(bytes)
    }

    /// Check presence without touching recency
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Insert or replace an artifact
    ///
    /// Least recently used entries are evicted until the new entry fits; the
    /// entry being inserted is never a candidate. An artifact larger than the
    /// whole budget is not cached (and any older copy under the same key is
    /// dropped). Returns whether the bytes were cached.
    pub fn put(&self, key: &str, bytes: ArtifactBytes) -> bool {
        let size = bytes.len() as u64;
        let mut state = self.state.lock();

        state.remove(key);

        if size > self.max_bytes {
            state.rejected += 1;
            tracing::debug!(
                key = %key,
                size_bytes = size,
                budget_bytes = self.max_bytes,
                "Artifact exceeds memory budget, serving from durable store only"
            );
            return false;
        }

        while state.current_bytes + size > self.max_bytes {
            let Some((evicted, entry)) = state.pop_lru() else {
                break;
            };
            state.evictions += 1;
            tracing::debug!(
                key = %evicted,
                size_bytes = entry.size_bytes,
                "Evicted artifact from memory tier"
            );
        }

        let tick = state.tick();
        state.order.insert(tick, key.to_string());
        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                bytes,
                size_bytes: size,
                last_accessed: Instant::now(),
                recency: tick,
            },
        );
        state.current_bytes += size;
        true
    }

    /// Remove the least recently used entry, returning its key
    pub fn evict_lru(&self) -> Option<String> {
        let mut state = self.state.lock();
        let (key, _) = state.pop_lru()?;
        state.evictions += 1;
        Some(key)
    }

    /// Drop an entry if present; returns whether one was removed
    pub fn invalidate(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.current_bytes = 0;
    }

    /// Number of cached artifacts
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Configured byte budget
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Time since the entry was last read or written
    #[must_use]
    pub fn idle_for(&self, key: &str) -> Option<std::time::Duration> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|e| e.last_accessed.elapsed())
    }

    /// Snapshot of usage counters
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            current_bytes: state.current_bytes,
            max_bytes: self.max_bytes,
            entry_count: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            rejected: state.rejected,
        }
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}
