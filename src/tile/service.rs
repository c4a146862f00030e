//! Tile Service for resolving tiles and metadata.
//!
//! The TileService is the main entry point for tile requests. It orchestrates:
//! - Coordinate translation (TMS row flip or quadkey)
//! - Connection lookup via the tileset connection cache
//! - Query execution on the blocking thread pool
//! - Cancellation of abandoned queries
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TileService                             │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                   resolve_tile()                        │    │
//! │  │  1. Get connection     3. Query on blocking pool        │    │
//! │  │  2. Compute row key    4. Map empty result to 404       │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │           │                               │                     │
//! │           ▼                               ▼                     │
//! │  ┌────────────────────────┐     ┌──────────────────────┐        │
//! │  │ TilesetConnectionCache │     │  AddressingScheme    │        │
//! │  └────────────────────────┘     └──────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use rusqlite::Connection;
use tracing::debug;

use crate::error::TileError;
use crate::tileset::{
    select_metadata, select_tile, QueryCancel, TilesetConnection, TilesetConnectionCache,
};

use super::addressing::{AddressingScheme, TileCoordinate};

// =============================================================================
// Tile Service
// =============================================================================

/// Service for resolving tiles and metadata from tileset databases.
///
/// # Example
///
/// ```ignore
/// use mbtiles_streamer::tile::{AddressingScheme, TileService};
///
/// let service = TileService::new(registry, AddressingScheme::Tms);
///
/// let tile = service.resolve_tile("parks", 2, 1, 1).await?;
/// println!("Tile size: {} bytes", tile.len());
/// ```
pub struct TileService {
    /// Open tileset databases
    registry: Arc<TilesetConnectionCache>,

    /// How tile rows are keyed
    addressing: AddressingScheme,
}

impl TileService {
    /// Create a new tile service.
    ///
    /// # Arguments
    ///
    /// * `registry` - Connection cache shared with other components
    /// * `addressing` - Row keying used by every tileset in this deployment
    pub fn new(registry: Arc<TilesetConnectionCache>, addressing: AddressingScheme) -> Self {
        Self {
            registry,
            addressing,
        }
    }

    pub fn registry(&self) -> &Arc<TilesetConnectionCache> {
        &self.registry
    }

    pub fn addressing(&self) -> AddressingScheme {
        self.addressing
    }

    /// Get the raw bytes of a tile.
    ///
    /// Coordinates are in XYZ convention. Fails with
    /// [`TileError::TilesetNotFound`] if the tileset does not exist and
    /// [`TileError::TileNotFound`] if no row matches.
    pub async fn resolve_tile(
        &self,
        tileset: &str,
        z: u32,
        x: u32,
        y: u32,
    ) -> Result<Bytes, TileError> {
        let coord = TileCoordinate::new(z, x, y);
        let not_found = || TileError::TileNotFound {
            tileset: tileset.to_string(),
            z,
            x,
            y,
        };

        // Resolve the tileset first so a missing tileset is always reported as such
        let conn = self.registry.get_or_open(tileset).await?;

        let Some(key) = self.addressing.row_key(coord) else {
            return Err(not_found());
        };

        let tile = self
            .with_connection(tileset, Some(conn), move |c| select_tile(c, &key))
            .await?;

        match tile {
            Some(data) => {
                debug!(tileset, tile = %coord, bytes = data.len(), "tile resolved");
                Ok(data)
            }
            None => Err(not_found()),
        }
    }

    /// Get the tileset's `metadata` table as a map.
    pub async fn resolve_metadata(
        &self,
        tileset: &str,
    ) -> Result<HashMap<String, String>, TileError> {
        self.with_connection(tileset, None, select_metadata).await
    }

    /// Run a query against a tileset, reopening once if the connection was
    /// released by eviction while we held it.
    async fn with_connection<T, F>(
        &self,
        tileset: &str,
        conn: Option<Arc<TilesetConnection>>,
        query: F,
    ) -> Result<T, TileError>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> rusqlite::Result<T> + Clone + Send + 'static,
    {
        let mut conn = conn;
        let mut retried = false;

        loop {
            let current = match conn.take() {
                Some(conn) => conn,
                None => self.registry.get_or_open(tileset).await?,
            };

            match run_interruptible(current, query.clone()).await {
                Err(TileError::ConnectionReleased(_)) if !retried => {
                    debug!(tileset, "connection released mid-request, reopening");
                    retried = true;
                }
                result => return result,
            }
        }
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Run `query` on the blocking pool.
///
/// If the caller stops waiting (e.g. the HTTP client disconnects), the
/// statement is interrupted, or never started if it is still waiting for a
/// connection.
async fn run_interruptible<T, F>(conn: Arc<TilesetConnection>, query: F) -> Result<T, TileError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
{
    let cancel = Arc::new(QueryCancel::new());
    let mut guard = InterruptOnDrop {
        tileset: conn.name().to_string(),
        cancel: cancel.clone(),
        armed: true,
    };

    let result =
        tokio::task::spawn_blocking(move || conn.run_cancellable(&cancel, query)).await;

    guard.armed = false;
    result.map_err(|e| TileError::Task(e.to_string()))?
}

/// Cancels this request's query if dropped while still armed.
struct InterruptOnDrop {
    tileset: String,
    cancel: Arc<QueryCancel>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            if self.cancel.is_running() {
                debug!(tileset = %self.tileset, "interrupting abandoned query");
            }
            self.cancel.cancel();
        }
    }
}
