//! Two-tier embedding cache for query-time embeddings.
//!
//! The in-process tier is a bounded LRU private to this process. The
//! persistent tier is a [`CacheStore`] that may be shared between processes.
//! Lookups go LRU, then store, then provider; a provider result is written to
//! both tiers. Entries never change after they are written and only leave the
//! cache through expiry or eviction.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::Embedding;
use crate::config::CacheConfig;
use crate::error::{EmbeddingError, Result};
use crate::retry::ProviderAdapter;

/// Fingerprint of a query text for a model.
///
/// SHA-256 over the trimmed text with whitespace runs collapsed, a NUL
/// separator and the model id, hex encoded.
pub fn fingerprint(text: &str, model: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::new()
        .chain_update(normalized.as_bytes())
        .chain_update([0u8])
        .chain_update(model.as_bytes())
        .finalize();
    format!("{digest:x}")
}

/// Cache entry for an embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint of the embedded text and model.
    pub fingerprint: String,

    /// The embedding vector.
    pub embedding: Embedding,

    /// Model used to generate the embedding.
    pub model: String,

    /// When the entry was created.
    pub created_at: DateTime<Utc>,

    /// When the entry stops being served.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The tier that answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// In-process LRU tier.
    Memory,
    /// Persistent tier.
    Persistent,
    /// Computed by the provider on a miss.
    Computed,
}

impl CacheSource {
    /// Whether the provider was skipped.
    pub fn is_hit(self) -> bool {
        !matches!(self, Self::Computed)
    }
}

/// Result of [`EmbeddingCache::get_or_compute`].
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEmbedding {
    pub embedding: Embedding,
    pub model: String,
    pub fingerprint: String,
    pub source: CacheSource,
}

/// Persistent cache tier.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up an entry. Expired entries are not returned.
    async fn get(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>>;

    /// Store an entry unless an unexpired one already exists for its
    /// fingerprint. Returns whether the entry was written.
    async fn put(&self, entry: CacheEntry) -> Result<bool>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Number of stored entries, expired ones included.
    async fn len(&self) -> Result<usize>;
}

/// Write `entry` into `entries` unless a live entry is already there.
fn insert_if_absent(
    entries: &mut HashMap<String, CacheEntry>,
    entry: CacheEntry,
    now: DateTime<Utc>,
) -> bool {
    match entries.get(&entry.fingerprint) {
        Some(existing) if !existing.is_expired(now) => false,
        _ => {
            entries.insert(entry.fingerprint.clone(), entry);
            true
        }
    }
}

fn purge(entries: &mut HashMap<String, CacheEntry>, now: DateTime<Utc>) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
}

/// Persistent tier held in memory. Useful for tests and single-process runs.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(fingerprint)
            .filter(|entry| !entry.is_expired(now))
            .cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(insert_if_absent(&mut entries, entry, Utc::now()))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(purge(&mut *self.entries.write().await, now))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// Persistent tier backed by a JSON file.
///
/// The whole file is rewritten through a temporary file and a rename after
/// every accepted write.
pub struct FileCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCacheStore {
    /// Open the store at `path`, loading existing entries and dropping
    /// expired ones.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            entries: RwLock::new(HashMap::new()),
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        };

        if fs::try_exists(&store.path).await? {
            store.load().await?;
        }

        Ok(store)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<()> {
        let content = fs::read_to_string(&self.path).await?;
        let loaded: Vec<CacheEntry> = serde_json::from_str(&content)?;
        let now = Utc::now();

        let mut entries = self.entries.write().await;
        let mut expired = 0usize;
        for entry in loaded {
            if entry.is_expired(now) {
                expired += 1;
                continue;
            }
            entries.insert(entry.fingerprint.clone(), entry);
        }

        info!(
            "Loaded {} cache entries from {} ({expired} expired)",
            entries.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let content = {
            let entries = self.entries.read().await;
            let snapshot: Vec<&CacheEntry> = entries.values().collect();
            serde_json::to_string(&snapshot)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!("Saved cache entries to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(fingerprint)
            .filter(|entry| !entry.is_expired(now))
            .cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<bool> {
        let written = {
            let mut entries = self.entries.write().await;
            insert_if_absent(&mut entries, entry, Utc::now())
        };
        if written {
            self.save().await?;
        }
        Ok(written)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = purge(&mut *self.entries.write().await, now);
        if removed > 0 {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    /// Entries currently in the in-process tier.
    pub memory_entries: usize,
    /// Capacity of the in-process tier.
    pub capacity: usize,
}

/// Read-through embedding cache over an LRU tier and a [`CacheStore`].
///
/// There is no per-key lock: concurrent misses for the same text may each
/// call the provider. The store keeps whichever entry landed first and every
/// caller ends up serving that entry.
pub struct EmbeddingCache {
    memory: Mutex<LruCache<String, CacheEntry>>,
    store: Arc<dyn CacheStore>,
    adapter: Arc<ProviderAdapter>,
    ttl: TimeDelta,
    capacity: usize,
    expected_dimension: Option<usize>,
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a cache over `store` computing misses through `adapter`.
    pub fn new(
        config: &CacheConfig,
        store: Arc<dyn CacheStore>,
        adapter: Arc<ProviderAdapter>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        let ttl = i64::try_from(config.ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);

        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            store,
            adapter,
            ttl,
            capacity: capacity.get(),
            expected_dimension: None,
            memory_hits: AtomicU64::new(0),
            persistent_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Reject provider vectors whose length is not `dimension`.
    pub fn with_expected_dimension(mut self, dimension: usize) -> Self {
        self.expected_dimension = Some(dimension);
        self
    }

    /// Build a cache from configuration, using a file store when a path is set.
    pub async fn from_config(config: &CacheConfig, adapter: Arc<ProviderAdapter>) -> Result<Self> {
        let store: Arc<dyn CacheStore> = match &config.path {
            Some(path) => Arc::new(FileCacheStore::open(path).await?),
            None => Arc::new(MemoryCacheStore::new()),
        };
        Ok(Self::new(config, store, adapter))
    }

    /// The persistent tier.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Return the embedding for `text` under `model`, computing it on a miss.
    pub async fn get_or_compute(&self, text: &str, model: &str) -> Result<CachedEmbedding> {
        let key = fingerprint(text, model);
        let now = Utc::now();

        {
            let mut memory = self.memory.lock().await;
            let live = memory.get(&key).filter(|entry| !entry.is_expired(now)).cloned();
            match live {
                Some(entry) => {
                    self.memory_hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit (memory) for {key}");
                    return Ok(Self::served(entry, CacheSource::Memory));
                }
                None => {
                    memory.pop(&key);
                }
            }
        }

        if let Some(entry) = self.store.get(&key, now).await? {
            self.persistent_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit (persistent) for {key}");
            self.memory.lock().await.put(key, entry.clone());
            return Ok(Self::served(entry, CacheSource::Persistent));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss for {key}, calling provider");
        let response = self.adapter.embed(text, model).await?;

        if let Some(expected) = self.expected_dimension {
            if response.embedding.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: response.embedding.len(),
                });
            }
        }

        let created_at = Utc::now();
        let mut entry = CacheEntry {
            fingerprint: key.clone(),
            embedding: response.embedding,
            model: model.to_string(),
            created_at,
            expires_at: created_at
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        if !self.store.put(entry.clone()).await? {
            // The stored entry wins so every process serves the same vector.
            if let Some(stored) = self.store.get(&key, Utc::now()).await? {
                debug!("Another writer cached {key} first; serving its entry");
                entry = stored;
            }
        }
        self.memory.lock().await.put(key, entry.clone());

        Ok(Self::served(entry, CacheSource::Computed))
    }

    fn served(entry: CacheEntry, source: CacheSource) -> CachedEmbedding {
        CachedEmbedding {
            embedding: entry.embedding,
            model: entry.model,
            fingerprint: entry.fingerprint,
            source,
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            persistent_hits: self.persistent_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_entries: self.memory.lock().await.len(),
            capacity: self.capacity,
        }
    }

    /// Drop the in-process tier. The persistent tier is untouched.
    pub async fn clear_memory(&self) {
        self.memory.lock().await.clear();
        info!("Cleared in-process embedding cache");
    }
}
