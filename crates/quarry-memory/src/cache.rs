//! Bounded, TTL-limited embedding cache keyed by content digest.
//!
//! All mutation happens under one lock so count and byte accounting stay exact
//! with concurrent writers. Eviction order is delegated to an
//! [`EvictionPolicy`]; the default evicts the least recently accessed entry
//! until both the entry cap and the byte cap hold.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const SNAPSHOT_VERSION: u32 = 1;
const ENTRY_OVERHEAD_BYTES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache snapshot I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache snapshot encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt cache snapshot {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub generated_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub approx_bytes: usize,
    /// Monotonic access ordinal; breaks ties between equal timestamps.
    #[serde(default)]
    pub access_seq: u64,
}

impl CacheEntry {
    #[must_use]
    pub fn new(key: &str, vector: Vec<f32>, model: &str, now: DateTime<Utc>) -> Self {
        let approx_bytes = vector.len() * std::mem::size_of::<f32>()
            + key.len()
            + model.len()
            + ENTRY_OVERHEAD_BYTES;
        Self {
            key: key.to_owned(),
            vector,
            model: model.to_owned(),
            generated_at: now,
            access_count: 0,
            last_accessed_at: now,
            approx_bytes,
            access_seq: 0,
        }
    }
}

/// Capacity and lifetime limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// Periodic snapshot interval; `None` persists only on shutdown.
    pub persist_interval: Option<Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 256 * 1024 * 1024,
            ttl: Duration::from_secs(7 * 24 * 3600),
            sweep_interval: Duration::from_secs(300),
            persist_interval: None,
        }
    }
}

pub trait EvictionPolicy: Send + Sync {
    /// Pick the next entry to evict, or `None` when `entries` is empty.
    fn select_victim<'a>(
        &self,
        entries: &mut dyn Iterator<Item = &'a CacheEntry>,
    ) -> Option<&'a CacheEntry>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyAccessed;

impl EvictionPolicy for LeastRecentlyAccessed {
    fn select_victim<'a>(
        &self,
        entries: &mut dyn Iterator<Item = &'a CacheEntry>,
    ) -> Option<&'a CacheEntry> {
        entries.min_by_key(|e| (e.last_accessed_at, e.access_seq))
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += to_delta(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheStats {
    pub count: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(removed.approx_bytes);
        Some(removed)
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot<T> {
    version: u32,
    entries: HashMap<String, T>,
}

pub struct EmbeddingCache {
    inner: Mutex<Inner>,
    policy: CachePolicy,
    ttl: TimeDelta,
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    eviction: Box<dyn EvictionPolicy>,
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("policy", &self.policy)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

impl EmbeddingCache {
    #[must_use]
    pub fn new(policy: CachePolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl: to_delta(policy.ttl),
            policy,
            path: None,
            clock,
            eviction: Box::new(LeastRecentlyAccessed),
        }
    }

    #[must_use]
    pub fn with_eviction(mut self, eviction: Box<dyn EvictionPolicy>) -> Self {
        self.eviction = eviction;
        self
    }

    /// Attach a snapshot path and load whatever it holds.
    ///
    /// A missing file yields an empty cache. Unreadable files and individual
    /// corrupt entries are dropped with a warning.
    pub async fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match self.load(&path).await {
            Ok(0) => {}
            Ok(loaded) => tracing::info!(loaded, path = %path.display(), "embedding cache loaded"),
            Err(e) => tracing::warn!("embedding cache not loaded: {e}"),
        }
        self.path = Some(path);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.generated_at > self.ttl
    }

    /// Present and not expired. Does not touch access bookkeeping.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|e| !self.is_expired(e, now))
    }

    /// Look up `key`, recording a hit or a miss. Expired entries read as absent
    /// until the next sweep removes them.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lookup(key, None)
    }

    /// Like [`get`](Self::get), but an entry produced by a different model is a miss.
    pub fn get_for_model(&self, key: &str, model: &str) -> Option<Vec<f32>> {
        self.lookup(key, Some(model)).map(|e| e.vector)
    }

    fn lookup(&self, key: &str, model: Option<&str>) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let usable = inner
            .entries
            .get(key)
            .is_some_and(|e| !self.is_expired(e, now) && model.is_none_or(|m| e.model == m));
        if !usable {
            inner.misses += 1;
            return None;
        }
        inner.hits += 1;
        let seq = inner.next_seq();
        let entry = inner.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed_at = now;
        entry.access_seq = seq;
        Some(entry.clone())
    }

    /// Store `entry` under `key`, evicting until both caps hold.
    ///
    /// Returns `false` when the entry alone exceeds the byte cap and was not stored.
    pub fn set(&self, key: &str, mut entry: CacheEntry) -> bool {
        entry.key = key.to_owned();
        if entry.approx_bytes > self.policy.max_bytes || self.policy.max_entries == 0 {
            tracing::warn!(
                key,
                bytes = entry.approx_bytes,
                "embedding larger than cache capacity, not cached"
            );
            return false;
        }
        let mut inner = self.lock();
        inner.remove(key);
        self.make_room(&mut inner, entry.approx_bytes);
        entry.access_seq = inner.next_seq();
        inner.total_bytes += entry.approx_bytes;
        inner.entries.insert(key.to_owned(), entry);
        true
    }

    /// Convenience wrapper around [`set`](Self::set) stamping the current time.
    pub fn insert(&self, key: &str, vector: Vec<f32>, model: &str) -> bool {
        let entry = CacheEntry::new(key, vector, model, self.clock.now());
        self.set(key, entry)
    }

    fn make_room(&self, inner: &mut Inner, incoming_bytes: usize) {
        while !inner.entries.is_empty()
            && (inner.entries.len() + 1 > self.policy.max_entries
                || inner.total_bytes + incoming_bytes > self.policy.max_bytes)
        {
            let Some(victim) = self
                .eviction
                .select_victim(&mut inner.entries.values())
                .map(|e| e.key.clone())
            else {
                break;
            };
            inner.remove(&victim);
            tracing::trace!(key = %victim, "evicted embedding");
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            count: inner.entries.len(),
            total_bytes: inner.total_bytes,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| self.is_expired(e, now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    async fn load(&self, path: &Path) -> Result<usize, CacheError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot<serde_json::Value> =
            serde_json::from_slice(&raw).map_err(|e| CacheError::Corrupt {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CacheError::Corrupt {
                path: path.to_owned(),
                reason: format!("unsupported snapshot version {}", snapshot.version),
            });
        }

        let now = self.clock.now();
        let mut decoded: Vec<CacheEntry> = Vec::with_capacity(snapshot.entries.len());
        let mut dropped = 0usize;
        for (key, value) in snapshot.entries {
            match serde_json::from_value::<CacheEntry>(value) {
                Ok(mut entry) if !self.is_expired(&entry, now) => {
                    entry.key = key;
                    decoded.push(entry);
                }
                Ok(_) => {}
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, path = %path.display(), "dropped corrupt cache entries");
        }

        decoded.sort_by_key(|e| (e.last_accessed_at, e.access_seq));
        let loaded = decoded.len();
        for entry in decoded {
            let key = entry.key.clone();
            self.set(&key, entry);
        }
        Ok(loaded)
    }

    /// Write the live entry set to the snapshot path, if one is configured.
    ///
    /// The snapshot is written to a sibling temp file and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or any filesystem step fails.
    pub async fn persist(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = {
            let inner = self.lock();
            Snapshot {
                version: SNAPSHOT_VERSION,
                entries: inner.entries.clone(),
            }
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(entries = snapshot.entries.len(), path = %path.display(), "embedding cache persisted");
        Ok(())
    }

    /// Persist and log instead of failing.
    pub async fn shutdown(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!("embedding cache persist failed: {e}");
        }
    }

    /// Spawn the background sweeper. It also persists on `persist_interval`
    /// when configured, and once more when `cancel` fires.
    #[must_use]
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(cache.policy.sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut persist = cache.policy.persist_interval.map(tokio::time::interval);
            sweep.tick().await;
            if let Some(p) = persist.as_mut() {
                p.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                p.tick().await;
            }

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "expired embeddings swept");
                        }
                    }
                    () = next_tick(persist.as_mut()) => cache.shutdown().await,
                }
            }
            cache.shutdown().await;
        })
    }
}

async fn next_tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}
