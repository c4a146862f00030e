use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use lru::LruCache;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use super::connection::{PoolOptions, TilesetConnection};
use crate::error::{StorageError, TileError};
use crate::vfs::StorageVfs;

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity for the connection cache (number of tilesets).
pub const DEFAULT_TILESET_CACHE_CAPACITY: usize = 20;

/// Default key prefix under which tilesets are published.
pub const DEFAULT_PREFIX: &str = "tilesets";

/// Default tileset file extension.
pub const DEFAULT_EXTENSION: &str = "mbtiles";

// =============================================================================
// TilesetLocation
// =============================================================================

/// Where tilesets live: `{scheme}://{bucket}/{prefix}/{tileset}.{extension}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilesetLocation {
    scheme: String,
    bucket: String,
    prefix: String,
    extension: String,
}

impl TilesetLocation {
    /// Location with the default prefix and extension.
    pub fn new(scheme: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    /// Key prefix; surrounding slashes are ignored and empty means the bucket root.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object URI for a tileset name.
    pub fn uri_for(&self, tileset: &str) -> String {
        if self.prefix.is_empty() {
            format!(
                "{}://{}/{}.{}",
                self.scheme, self.bucket, tileset, self.extension
            )
        } else {
            format!(
                "{}://{}/{}/{}.{}",
                self.scheme, self.bucket, self.prefix, tileset, self.extension
            )
        }
    }
}

/// Tileset names map directly into object keys, so anything that could
/// address a different key is refused.
pub fn is_valid_tileset_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0'])
}

// =============================================================================
// TilesetConnectionCache
// =============================================================================

/// State for an in-flight open, shared by the leader and its waiters.
struct InFlightOpen {
    notify: Notify,
    result: OnceLock<Result<Arc<TilesetConnection>, TileError>>,
}

/// Bounded cache of open tileset databases.
///
/// The cache:
/// - Keeps at most `capacity` connections, evicting the least recently used
/// - Confirms a tileset exists before opening it through the VFS
/// - Uses singleflight so concurrent first requests share one open
/// - Releases (closes) every connection it drops
pub struct TilesetConnectionCache {
    vfs: Arc<StorageVfs>,
    location: TilesetLocation,

    /// Sizing of each tileset's read pool
    pool: PoolOptions,

    /// Open connections indexed by tileset name
    cache: RwLock<LruCache<String, Arc<TilesetConnection>>>,

    /// In-flight opens for singleflight pattern
    in_flight: Mutex<HashMap<String, Arc<InFlightOpen>>>,

    /// Number of connections opened over the cache's lifetime
    opens: AtomicUsize,
}

impl TilesetConnectionCache {
    /// Create a cache with [`DEFAULT_TILESET_CACHE_CAPACITY`].
    pub fn new(vfs: Arc<StorageVfs>, location: TilesetLocation) -> Self {
        Self::with_capacity(vfs, location, DEFAULT_TILESET_CACHE_CAPACITY)
    }

    /// Create a cache holding up to `capacity` connections (at least one).
    ///
    /// # Arguments
    /// * `vfs` - Registered VFS that connections are opened through
    /// * `location` - Maps tileset names to object URIs
    /// * `capacity` - Maximum number of open connections
    pub fn with_capacity(vfs: Arc<StorageVfs>, location: TilesetLocation, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            vfs,
            location,
            pool: PoolOptions::default(),
            cache: RwLock::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
            opens: AtomicUsize::new(0),
        }
    }

    /// Use `options` for every tileset opened from now on.
    pub fn with_pool_options(mut self, options: PoolOptions) -> Self {
        self.pool = options;
        self
    }

    pub fn pool_options(&self) -> &PoolOptions {
        &self.pool
    }

    pub fn location(&self) -> &TilesetLocation {
        &self.location
    }

    pub fn vfs(&self) -> &Arc<StorageVfs> {
        &self.vfs
    }

    /// Get the connection for a tileset, opening it if not already cached.
    ///
    /// This method:
    /// 1. Returns a cached connection, marking it most recently used
    /// 2. Otherwise checks the object exists and opens it through the VFS
    /// 3. Uses singleflight so concurrent callers share one check and open
    ///
    /// A missing or inaccessible object yields [`TileError::TilesetNotFound`].
    pub async fn get_or_open(&self, tileset: &str) -> Result<Arc<TilesetConnection>, TileError> {
        if !is_valid_tileset_name(tileset) {
            return Err(TileError::TilesetNotFound {
                tileset: tileset.to_string(),
            });
        }

        // Fast path: check cache
        if let Some(conn) = self.cached(tileset).await {
            return Ok(conn);
        }

        // Slow path: join an in-flight open or become leader
        loop {
            let (state, is_leader) = {
                let mut in_flight = self.lock_in_flight();
                match in_flight.get(tileset) {
                    Some(state) => (state.clone(), false),
                    None => {
                        let state = Arc::new(InFlightOpen {
                            notify: Notify::new(),
                            result: OnceLock::new(),
                        });
                        in_flight.insert(tileset.to_string(), state.clone());
                        (state, true)
                    }
                }
            };

            if is_leader {
                let _guard = OpenGuard {
                    registry: self,
                    tileset,
                };

                // A previous leader may have finished while we were claiming
                let result = match self.cached(tileset).await {
                    Some(conn) => Ok(conn),
                    None => self.open_and_insert(tileset).await,
                };

                let _ = state.result.set(result.clone());
                return result;
            }

            // Register before re-checking so the leader's wakeup cannot be missed
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let still_running = self
                .lock_in_flight()
                .get(tileset)
                .is_some_and(|current| Arc::ptr_eq(current, &state));
            if still_running && state.result.get().is_none() {
                notified.await;
            }

            if let Some(result) = state.result.get() {
                return result.clone();
            }

            // Leader was cancelled before finishing; try again
        }
    }

    async fn cached(&self, tileset: &str) -> Option<Arc<TilesetConnection>> {
        let mut cache = self.cache.write().await;
        match cache.get(tileset) {
            Some(conn) if !conn.is_released() => Some(conn.clone()),
            _ => None,
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<InFlightOpen>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check existence, open, and cache a connection (internal implementation).
    async fn open_and_insert(&self, tileset: &str) -> Result<Arc<TilesetConnection>, TileError> {
        let not_found = || TileError::TilesetNotFound {
            tileset: tileset.to_string(),
        };

        let uri = self.location.uri_for(tileset);
        let (backend, object) = self.vfs.registry().resolve(&uri)?;

        let size = match backend.file_size(&object).await {
            Ok(size) => size,
            Err(err @ (StorageError::NotFound(_) | StorageError::Transient(_))) => {
                debug!(tileset, uri = %uri, error = %err, "tileset unavailable");
                return Err(not_found());
            }
            Err(err) => return Err(err.into()),
        };
        self.vfs.remember_size(&uri, size);

        let vfs = self.vfs.clone();
        let name = tileset.to_string();
        let open_uri = uri.clone();
        let options = self.pool.clone();
        let conn = tokio::task::spawn_blocking(move || {
            TilesetConnection::open(name, open_uri, vfs, &options)
        })
            .await
            .map_err(|e| TileError::Task(e.to_string()))?
            .map_err(|err| match err {
                TileError::Storage(StorageError::NotFound(_)) => not_found(),
                other => other,
            })?;

        self.opens.fetch_add(1, Ordering::Relaxed);
        info!(tileset, uri = %uri, size, "opened tileset");

        let conn = Arc::new(conn);
        let displaced = self
            .cache
            .write()
            .await
            .push(tileset.to_string(), conn.clone());

        if let Some((evicted, old)) = displaced {
            if !Arc::ptr_eq(&old, &conn) {
                debug!(evicted = %evicted, "evicting tileset connection");
                if evicted != tileset {
                    self.vfs.forget_size(old.uri());
                }
                release(old).await;
            }
        }

        Ok(conn)
    }

    /// Drop a tileset's connection, closing it.
    ///
    /// The next request reopens the tileset, re-checking that it exists.
    pub async fn invalidate(&self, tileset: &str) {
        let removed = self.cache.write().await.pop(tileset);
        self.vfs.forget_size(&self.location.uri_for(tileset));

        if let Some(conn) = removed {
            release(conn).await;
        }
    }

    /// Drop and close every cached connection.
    pub async fn clear(&self) {
        let drained: Vec<_> = {
            let mut cache = self.cache.write().await;
            let mut drained = Vec::with_capacity(cache.len());
            while let Some((_, conn)) = cache.pop_lru() {
                drained.push(conn);
            }
            drained
        };

        for conn in drained {
            self.vfs.forget_size(conn.uri());
            release(conn).await;
        }
    }

    /// Get the number of cached connections.
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Number of connections opened so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

/// Close a connection on the blocking pool, waiting for it to finish.
async fn release(conn: Arc<TilesetConnection>) {
    let name = conn.name().to_string();
    if let Err(err) = tokio::task::spawn_blocking(move || conn.release()).await {
        warn!(tileset = %name, error = %err, "failed to release tileset connection");
    }
}

/// Clears the in-flight marker and wakes waiters when the leader finishes
/// or is dropped.
struct OpenGuard<'a> {
    registry: &'a TilesetConnectionCache,
    tileset: &'a str,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        let state = self.registry.lock_in_flight().remove(self.tileset);
        if let Some(state) = state {
            state.notify.notify_waiters();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
