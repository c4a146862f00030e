use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::error::StorageError;

/// Default chunk size: 96KB (24 SQLite pages of 4KB).
/// Large enough to amortize request latency across neighbouring pages of
/// a B-tree, small enough that a single tile lookup stays cheap.
pub const DEFAULT_CHUNK_SIZE: usize = 4096 * 24;

/// Default cache capacity in number of chunks.
/// 128 chunks * 96KB = 12MB default cache size.
pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 128;

/// Identifies one chunk: the object it belongs to and its aligned start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    file: Arc<str>,
    start: u64,
}

impl ChunkKey {
    pub fn new(file: Arc<str>, start: u64) -> Self {
        Self { file, start }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn start(&self) -> u64 {
        self.start
    }
}

/// Snapshot of a cache's hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// A fetch in progress, shared by the leader and its waiters.
struct InFlight {
    notify: Notify,
    outcome: OnceLock<Result<Bytes, StorageError>>,
}

/// Shared, bounded cache of fixed-size chunks.
///
/// One instance serves every open [`RemoteFile`](super::RemoteFile), keyed
/// by `(file identity, chunk start)`. Only complete chunks are ever stored.
///
/// Features:
/// - LRU eviction when the cache reaches capacity
/// - Singleflight: concurrent misses for the same chunk share one fetch
/// - Per-instance hit/miss counters
pub struct ChunkCache {
    /// Cached chunks
    chunks: RwLock<LruCache<ChunkKey, Bytes>>,
    /// In-flight chunk fetches for the singleflight pattern
    in_flight: Mutex<HashMap<ChunkKey, Arc<InFlight>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCache {
    /// Create a cache holding up to [`DEFAULT_CHUNK_CACHE_CAPACITY`] chunks.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHUNK_CACHE_CAPACITY)
    }

    /// Create a cache holding up to `capacity` chunks (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            chunks: RwLock::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a chunk, counting the outcome and bumping its recency.
    pub async fn get(&self, key: &ChunkKey) -> Option<Bytes> {
        let found = self.chunks.write().await.get(key).cloned();
        self.record(found.is_some());
        found
    }

    /// Store a complete chunk.
    pub async fn insert(&self, key: ChunkKey, data: Bytes) {
        self.chunks.write().await.put(key, data);
    }

    /// Whether a chunk is cached, without counting or touching recency.
    pub async fn contains(&self, key: &ChunkKey) -> bool {
        self.chunks.read().await.contains(key)
    }

    /// Number of cached chunks.
    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current hit/miss counters.
    pub fn stats(&self) -> ChunkCacheStats {
        ChunkCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<ChunkKey, Arc<InFlight>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a chunk from cache or fetch it with `fetch`.
    ///
    /// Implements the singleflight pattern: if multiple tasks miss on the same
    /// chunk concurrently, only one runs its fetch and every waiter receives
    /// that fetch's outcome. Successful non-empty results are cached; errors
    /// never are. If the fetching task is dropped mid-flight, waiters retry.
    pub async fn get_or_fetch<F, Fut>(&self, key: ChunkKey, fetch: F) -> Result<Bytes, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, StorageError>>,
    {
        let mut counted = false;

        let guard = loop {
            // Fast path: check cache
            if let Some(data) = self.chunks.write().await.get(&key).cloned() {
                if !counted {
                    self.record(true);
                }
                return Ok(data);
            }
            if !counted {
                self.record(false);
                counted = true;
            }

            // Slow path: join an in-flight fetch or become leader
            let waiting = {
                let mut in_flight = self.lock_in_flight();
                match in_flight.get(&key) {
                    Some(entry) => Some(entry.clone()),
                    None => {
                        let entry = Arc::new(InFlight {
                            notify: Notify::new(),
                            outcome: OnceLock::new(),
                        });
                        in_flight.insert(key.clone(), entry.clone());
                        None
                    }
                }
            };

            let Some(entry) = waiting else {
                break InFlightGuard {
                    cache: self,
                    key: key.clone(),
                };
            };

            // Register interest before re-checking, so a completion racing
            // with us cannot be missed.
            let notified = entry.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let still_running = self
                .lock_in_flight()
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &entry));
            if still_running && entry.outcome.get().is_none() {
                notified.await;
            }

            if let Some(outcome) = entry.outcome.get() {
                return outcome.clone();
            }
            // Leader was cancelled before finishing; loop back to check cache
        };

        // Another leader may have finished between the lookup and the claim
        if let Some(data) = self.chunks.write().await.get(&key).cloned() {
            guard.finish(Ok(data.clone()));
            return Ok(data);
        }

        debug!(file = key.file(), start = key.start(), "fetching chunk");
        let result = fetch().await;

        if let Ok(ref data) = result {
            if !data.is_empty() {
                self.chunks.write().await.put(key.clone(), data.clone());
            }
        }

        guard.finish(result.clone());
        result
    }
}

/// Clears the in-flight marker and wakes waiters when the leader finishes
/// or is dropped.
struct InFlightGuard<'a> {
    cache: &'a ChunkCache,
    key: ChunkKey,
}

impl InFlightGuard<'_> {
    fn finish(self, outcome: Result<Bytes, StorageError>) {
        if let Some(entry) = self.cache.lock_in_flight().get(&self.key) {
            let _ = entry.outcome.set(outcome);
        }
        // Drop removes the marker and notifies
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let entry = self.cache.lock_in_flight().remove(&self.key);
        if let Some(entry) = entry {
            entry.notify.notify_waiters();
        }
    }
}
