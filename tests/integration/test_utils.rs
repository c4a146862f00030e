//! Test utilities for integration tests.
//!
//! This module builds small MBTiles databases on disk with rusqlite and
//! publishes them to an in-memory backend, then wires up the VFS, the
//! connection cache and the tile service the same way the binary does.

use std::sync::Arc;

use bytes::Bytes;
use rusqlite::{params, Connection};

use mbtiles_streamer::server::{create_router, RouterConfig};
use mbtiles_streamer::storage::{BackendRegistry, ChunkCache, MemoryBackend};
use mbtiles_streamer::tile::{quadkey_to_tile, tms_row, AddressingScheme, TileService};
use mbtiles_streamer::tileset::{PoolOptions, TilesetConnectionCache, TilesetLocation};
use mbtiles_streamer::vfs::StorageVfs;

/// Bucket every fixture is published to.
pub const BUCKET: &str = "tiles";

/// Chunk size used by fixtures unless a test overrides it.
pub const TEST_CHUNK_SIZE: usize = 4096;

/// Public URL template used by router fixtures.
pub const TEST_TILE_URL: &str = "https://maps.example.com/tile/{tileset}/{z}/{x}/{y}.mvt";

// =============================================================================
// MBTiles Builders
// =============================================================================

/// One row of a TMS-keyed `tiles` table.
pub struct TmsRow {
    pub zoom: i64,
    pub column: i64,
    pub row: i64,
    pub data: Vec<u8>,
}

impl TmsRow {
    pub fn new(zoom: i64, column: i64, row: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            zoom,
            column,
            row,
            data: data.into(),
        }
    }
}

/// Create a database file with `schema`, fill it with `fill`, and return its bytes.
fn build_database(schema: &str, fill: impl FnOnce(&Connection)) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.mbtiles");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA page_size = 4096;").unwrap();
    conn.execute_batch(schema).unwrap();
    fill(&conn);
    drop(conn);

    std::fs::read(&path).unwrap()
}

fn insert_metadata(conn: &Connection, metadata: &[(&str, &str)]) {
    for (name, value) in metadata {
        conn.execute(
            "INSERT INTO metadata (name, value) VALUES (?, ?)",
            params![name, value],
        )
        .unwrap();
    }
}

/// Build a standard MBTiles database with TMS-keyed tiles.
pub fn tms_mbtiles(tiles: &[TmsRow], metadata: &[(&str, &str)]) -> Vec<u8> {
    build_database(
        "CREATE TABLE metadata (name TEXT, value TEXT);
         CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER,
                             tile_row INTEGER, tile_data BLOB);
         CREATE UNIQUE INDEX tile_index ON tiles (zoom_level, tile_column, tile_row);",
        |conn| {
            insert_metadata(conn, metadata);
            for tile in tiles {
                conn.execute(
                    "INSERT INTO tiles VALUES (?, ?, ?, ?)",
                    params![tile.zoom, tile.column, tile.row, tile.data],
                )
                .unwrap();
            }
        },
    )
}

/// Build a database whose tiles are keyed by quadkey.
///
/// The TMS columns are filled in as well, decoded from each key, so the
/// same file can be served under either addressing scheme.
pub fn quadkey_mbtiles(tiles: &[(&str, Vec<u8>)], metadata: &[(&str, &str)]) -> Vec<u8> {
    build_database(
        "CREATE TABLE metadata (name TEXT, value TEXT);
         CREATE TABLE tiles (quadkey TEXT PRIMARY KEY, zoom_level INTEGER,
                             tile_column INTEGER, tile_row INTEGER, tile_data BLOB);",
        |conn| {
            insert_metadata(conn, metadata);
            for (quadkey, data) in tiles {
                let coord = quadkey_to_tile(quadkey).unwrap();
                conn.execute(
                    "INSERT INTO tiles VALUES (?, ?, ?, ?, ?)",
                    params![quadkey, coord.z, coord.x, tms_row(coord).unwrap(), data],
                )
                .unwrap();
            }
        },
    )
}

/// Build a tileset large enough to span many chunks.
///
/// Every tile at zoom 4 is present; its payload is 2 KB of a byte derived
/// from its position.
pub fn large_mbtiles() -> Vec<u8> {
    let mut tiles = Vec::new();
    for column in 0..16 {
        for row in 0..16 {
            tiles.push(TmsRow::new(4, column, row, tile_payload(column, row)));
        }
    }
    tms_mbtiles(&tiles, &[("name", "Large")])
}

/// Payload stored at zoom 4 by [`large_mbtiles`].
pub fn tile_payload(column: i64, row: i64) -> Vec<u8> {
    vec![(column * 16 + row) as u8; 2048]
}

/// The tileset used by most scenarios: one tile at (2, 1, TMS row 2).
pub fn parks_mbtiles() -> Vec<u8> {
    tms_mbtiles(
        &[TmsRow::new(2, 1, 2, b"parks-2-1-1".to_vec())],
        &[
            ("name", "Parks"),
            ("format", "pbf"),
            ("minzoom", "0"),
            ("maxzoom", "6"),
            ("bounds", "-123.1,37.6,-122.3,37.9"),
            (
                "json",
                r#"{"vector_layers":[{"id":"parks","fields":{"name":"String"}}]}"#,
            ),
        ],
    )
}

// =============================================================================
// Harness
// =============================================================================

/// Storage, VFS and connection cache wired together over a memory backend.
pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub tilesets: Arc<TilesetConnectionCache>,
}

impl Harness {
    /// Harness with default chunk size and capacities.
    pub fn new() -> Self {
        Self::with_options(TEST_CHUNK_SIZE, 64, 4)
    }

    /// Harness with explicit chunk size, chunk-cache and tileset-cache capacity.
    ///
    /// Must be called from within a multi-threaded Tokio runtime.
    pub fn with_options(
        chunk_size: usize,
        chunk_cache_capacity: usize,
        tileset_capacity: usize,
    ) -> Self {
        Self::with_pool(
            chunk_size,
            chunk_cache_capacity,
            tileset_capacity,
            PoolOptions::default(),
        )
    }

    /// Like [`with_options`](Self::with_options), with explicit read pools.
    pub fn with_pool(
        chunk_size: usize,
        chunk_cache_capacity: usize,
        tileset_capacity: usize,
        pool: PoolOptions,
    ) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let registry = BackendRegistry::new().with_backend(backend.clone());
        let vfs = StorageVfs::new(
            registry,
            Arc::new(ChunkCache::with_capacity(chunk_cache_capacity)),
            chunk_size,
            tokio::runtime::Handle::current(),
        )
        .register()
        .unwrap();

        let location = TilesetLocation::new("mem", BUCKET);
        let tilesets = Arc::new(
            TilesetConnectionCache::with_capacity(vfs, location, tileset_capacity)
                .with_pool_options(pool),
        );

        Self { backend, tilesets }
    }

    /// Publish a tileset under its name.
    pub fn publish(&self, tileset: &str, data: Vec<u8>) {
        let key = format!("tilesets/{}.mbtiles", tileset);
        self.backend.put(BUCKET, &key, Bytes::from(data));
    }

    pub fn service(&self, addressing: AddressingScheme) -> TileService {
        TileService::new(self.tilesets.clone(), addressing)
    }

    pub fn router(&self, addressing: AddressingScheme) -> axum::Router {
        create_router(
            self.service(addressing),
            RouterConfig::new(TEST_TILE_URL)
                .with_cache_max_age(600)
                .with_tracing(false),
        )
    }

    pub async fn chunk_cache_len(&self) -> usize {
        self.tilesets.vfs().chunk_cache().len().await
    }
}
