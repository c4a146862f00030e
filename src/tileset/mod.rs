//! Tileset database handles.
//!
//! A tileset is an MBTiles database published as a single object. The
//! [`TilesetConnectionCache`] maps tileset names to open, read-only SQLite
//! connections made through the [`StorageVfs`](crate::vfs::StorageVfs):
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Tile Service               │
//! └────────────────────┬────────────────────┘
//!                      │ tileset name
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │        TilesetConnectionCache           │
//! │  (LRU, singleflight, existence check)   │
//! │   one bounded read pool per tileset     │
//! └────────────────────┬────────────────────┘
//!                      │ SQLite page reads
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │     StorageVfs → RemoteFile → Backend   │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod registry;

pub use connection::{
    select_metadata, select_tile, PoolOptions, QueryCancel, TilesetConnection,
    DEFAULT_CHECKOUT_TIMEOUT, DEFAULT_POOL_SIZE,
};
pub use registry::{
    is_valid_tileset_name, TilesetConnectionCache, TilesetLocation, DEFAULT_EXTENSION,
    DEFAULT_PREFIX, DEFAULT_TILESET_CACHE_CAPACITY,
};
