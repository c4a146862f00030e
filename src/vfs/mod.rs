//! SQLite VFS over object storage.
//!
//! [`StorageVfs`] binds database names of the form `{scheme}://{bucket}/{key}`
//! to [`RemoteFile`] handles, so that every page the SQLite pager reads is
//! served from the chunk cache or a ranged fetch against the backend.
//!
//! The VFS is strictly read-only:
//! - opens always report read-only, and never create objects
//! - journal, WAL and temp files are refused
//! - deletes and writes fail
//! - the device is reported immutable, so SQLite takes no locks
//!
//! SQLite calls the VFS synchronously, so connections using it must run on
//! blocking threads (e.g. inside `tokio::task::spawn_blocking`). Callbacks
//! drive the async storage layer through the captured runtime handle.

mod ffi;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::storage::{BackendRegistry, ChunkCache, RemoteFile};

/// Sidecar files SQLite checks for; none can exist for a published object.
const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

static NEXT_VFS_ID: AtomicUsize = AtomicUsize::new(0);

/// Read-only SQLite VFS backed by a [`BackendRegistry`] and a shared
/// [`ChunkCache`].
pub struct StorageVfs {
    name: String,
    registry: BackendRegistry,
    cache: Arc<ChunkCache>,
    chunk_size: usize,
    runtime: Handle,
    /// Last storage error per file and calling thread, for the connection
    /// layer to surface. SQLite runs callbacks on the querying thread, so
    /// concurrent connections to one file keep separate slots.
    errors: Mutex<HashMap<(String, ThreadId), StorageError>>,
    /// Object sizes already known from existence checks
    known_sizes: Mutex<HashMap<String, u64>>,
}

impl StorageVfs {
    /// Create an unregistered VFS with a process-unique name.
    ///
    /// # Arguments
    /// * `registry` - Backends, selected by URI scheme on open
    /// * `cache` - Chunk cache shared by every file this VFS opens
    /// * `chunk_size` - Fetch granularity, a multiple of 4096
    /// * `runtime` - Runtime that drives storage I/O from SQLite callbacks
    pub fn new(
        registry: BackendRegistry,
        cache: Arc<ChunkCache>,
        chunk_size: usize,
        runtime: Handle,
    ) -> Self {
        let id = NEXT_VFS_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("storagevfs-{}", id),
            registry,
            cache,
            chunk_size,
            runtime,
            errors: Mutex::new(HashMap::new()),
            known_sizes: Mutex::new(HashMap::new()),
        }
    }

    /// Register with SQLite so connections can name this VFS.
    ///
    /// The registration lasts for the life of the process.
    pub fn register(self) -> Result<Arc<Self>, StorageError> {
        let vfs = Arc::new(self);
        ffi::register(vfs.clone())?;
        info!(vfs = %vfs.name, schemes = ?vfs.registry.schemes(), "registered storage VFS");
        Ok(vfs)
    }

    /// Name to pass to `sqlite3_open_v2`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn chunk_cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Build a read-only file handle for `uri`.
    ///
    /// Only the backend lookup happens here; the object's size is fetched
    /// on first use unless it was remembered from an earlier check.
    pub fn open(&self, uri: &str) -> Result<RemoteFile, StorageError> {
        let (backend, object) = self.registry.resolve(uri)?;
        let file = RemoteFile::new(object, backend, self.cache.clone(), self.chunk_size);

        let known = self
            .known_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .copied();

        debug!(vfs = %self.name, uri, known_size = ?known, "opening remote file");
        Ok(match known {
            Some(size) => file.with_known_size(size),
            None => file,
        })
    }

    /// Always fails: nothing is ever deleted.
    pub fn delete(&self, _name: &str) -> Result<(), StorageError> {
        Err(StorageError::ReadOnlyViolation("delete"))
    }

    /// Whether SQLite should consider `name` present.
    ///
    /// Journal, WAL and shared-memory sidecars never exist, so SQLite never
    /// attempts hot-journal recovery.
    pub fn access(&self, name: &str) -> bool {
        !SIDECAR_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    }

    /// Names are already canonical.
    pub fn full_pathname<'a>(&self, name: &'a str) -> &'a str {
        name
    }

    /// Remember an object's size so the next open skips the size query.
    pub fn remember_size(&self, uri: &str, size: u64) {
        self.known_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.to_string(), size);
    }

    /// Forget a remembered size.
    pub fn forget_size(&self, uri: &str) {
        self.known_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uri);
    }

    /// Number of object sizes currently remembered.
    pub fn remembered_sizes(&self) -> usize {
        self.known_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record a storage error raised inside a SQLite callback on this thread.
    pub fn record_error(&self, uri: &str, err: StorageError) {
        warn!(vfs = %self.name, uri, error = %err, "storage error inside SQLite");
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((uri.to_string(), thread::current().id()), err);
    }

    /// Take the last storage error this thread recorded for `uri`, if any.
    pub fn take_error(&self, uri: &str) -> Option<StorageError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(uri.to_string(), thread::current().id()))
    }

    /// Drive a storage future to completion from a blocking thread.
    ///
    /// Panics if called from within an async context; the callbacks catch
    /// that and report an I/O error instead.
    pub(crate) fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
}

impl fmt::Debug for StorageVfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageVfs")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
