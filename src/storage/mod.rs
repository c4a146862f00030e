//! Object storage access for tileset databases.
//!
//! This module provides the byte-level plumbing beneath the SQLite VFS:
//!
//! - [`StorageBackend`]: size and range queries against a named object store
//! - [`BackendRegistry`]: scheme-keyed selection of backends
//! - [`ChunkCache`]: shared LRU of fixed-size, aligned chunks
//! - [`RemoteFile`]: read-only random access over a backend and the cache
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mbtiles_streamer::storage::{BackendRegistry, ChunkCache, MemoryBackend, RemoteFile};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! backend.put("bucket", "tilesets/parks.mbtiles", bytes);
//!
//! let registry = BackendRegistry::new().with_backend(backend);
//! let (backend, uri) = registry.resolve("mem://bucket/tilesets/parks.mbtiles")?;
//! let file = RemoteFile::new(uri, backend, Arc::new(ChunkCache::new()), 4096 * 24);
//!
//! let mut header = [0u8; 100];
//! file.read_at(&mut header, 0).await?;
//! ```

mod backend;
mod chunk_cache;
mod fs;
mod memory;
mod remote_file;
mod s3;

pub use backend::{
    BackendRegistry, ByteStream, ObjectUri, StorageBackend, DEFAULT_READ_TIMEOUT,
    DEFAULT_SIZE_TIMEOUT,
};
pub use chunk_cache::{
    ChunkCache, ChunkCacheStats, ChunkKey, DEFAULT_CHUNK_CACHE_CAPACITY, DEFAULT_CHUNK_SIZE,
};
pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use remote_file::RemoteFile;
pub use s3::{create_gcs_client, create_s3_client, S3Backend, GCS_ENDPOINT};
