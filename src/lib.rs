//! # MBTiles Streamer
//!
//! A tile server for MBTiles databases stored in object storage.
//!
//! Tilesets are SQLite databases published as single, immutable objects in
//! S3, Google Cloud Storage or a local directory. Instead of downloading
//! them, this library registers a read-only SQLite VFS that turns every page
//! read into an aligned, cached range request, so a tile lookup touches only
//! the few pages its B-tree search visits.
//!
//! ## Features
//!
//! - **Range-based streaming**: SQLite pages are fetched with HTTP range requests
//! - **Shared chunk cache**: Aligned chunks are cached across all open tilesets
//! - **Connection cache**: Open databases are kept in a bounded LRU
//! - **TMS and quadkey addressing**: One scheme per deployment
//! - **TileJSON**: Synthesized from each tileset's `metadata` table
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`storage`] - Storage backends, chunk cache and remote files
//! - [`vfs`] - SQLite VFS over the storage layer
//! - [`tileset`] - Tileset connections and their cache
//! - [`tile`] - Tile addressing and the tile service
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mbtiles_streamer::{
//!     create_router, AddressingScheme, BackendRegistry, ChunkCache, MemoryBackend,
//!     RouterConfig, StorageVfs, TileService, TilesetConnectionCache, TilesetLocation,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let backends = BackendRegistry::new().with_backend(Arc::new(MemoryBackend::new()));
//!     let vfs = StorageVfs::new(
//!         backends,
//!         Arc::new(ChunkCache::new()),
//!         4096 * 24,
//!         tokio::runtime::Handle::current(),
//!     )
//!     .register()
//!     .unwrap();
//!
//!     let tilesets = TilesetConnectionCache::new(vfs, TilesetLocation::new("mem", "maps"));
//!     let service = TileService::new(Arc::new(tilesets), AddressingScheme::Tms);
//!     let router = create_router(service, RouterConfig::default());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod config;
pub mod error;
pub mod server;
pub mod storage;
pub mod tile;
pub mod tileset;
pub mod vfs;

// Re-export commonly used types
pub use config::{CheckConfig, Cli, Command, ServeConfig, StorageArgs};
pub use error::{StorageError, TileError};
pub use server::{
    create_router, health_handler, tile_handler, tilejson_handler, AppState, ErrorResponse,
    HealthResponse, RouterConfig, TileJson, TilePathParams, VectorLayer,
};
pub use storage::{
    create_gcs_client, create_s3_client, BackendRegistry, ChunkCache, ChunkCacheStats, ChunkKey,
    FsBackend, MemoryBackend, ObjectUri, RemoteFile, S3Backend, StorageBackend,
};
pub use tile::{AddressingScheme, RowKey, TileCoordinate, TileService};
pub use tileset::{TilesetConnection, TilesetConnectionCache, TilesetLocation};
pub use vfs::StorageVfs;
