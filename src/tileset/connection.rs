use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use r2d2::{HandleError, ManageConnection, Pool};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, InterruptHandle, OpenFlags, OptionalExtension};
use scheduled_thread_pool::ScheduledThreadPool;
use tracing::{debug, warn};

use crate::error::{StorageError, TileError};
use crate::tile::RowKey;
use crate::vfs::StorageVfs;

const TMS_TILE_QUERY: &str =
    "SELECT tile_data FROM tiles WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?";

const QUADKEY_TILE_QUERY: &str = "SELECT tile_data FROM tiles WHERE quadkey = ?";

const METADATA_QUERY: &str = "SELECT name, value FROM metadata";

/// Prepared statements kept per connection.
const STATEMENT_CACHE_CAPACITY: usize = 8;

/// Default number of read connections per tileset.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// How long a query waits for a free connection.
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Pool
// =============================================================================

/// Opens read-only connections to one tileset through the VFS.
#[derive(Debug)]
struct VfsConnectionManager {
    name: String,
    uri: String,
    vfs: Arc<StorageVfs>,
}

impl ManageConnection for VfsConnectionManager {
    type Connection = Connection;
    type Error = TileError;

    fn connect(&self) -> Result<Connection, TileError> {
        open_read_only(&self.name, &self.uri, &self.vfs)
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), TileError> {
        conn.execute_batch("").map_err(TileError::from)
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

/// Routes pool connect failures to tracing.
#[derive(Debug)]
struct LogConnectErrors {
    tileset: String,
}

impl HandleError<TileError> for LogConnectErrors {
    fn handle_error(&self, error: TileError) {
        warn!(tileset = %self.tileset, error = %error, "failed to open pooled connection");
    }
}

/// Sizing for the per-tileset read pools.
#[derive(Clone)]
pub struct PoolOptions {
    /// Most connections open at once for a single tileset
    pub max_size: usize,

    /// How long a query waits for a free connection
    pub checkout_timeout: Duration,

    /// Threads that open connections and reap idle ones, shared by all pools
    pub workers: Arc<ScheduledThreadPool>,
}

impl PoolOptions {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
            workers: Arc::new(ScheduledThreadPool::with_name("tileset-pool-{}", 2)),
        }
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("max_size", &self.max_size)
            .field("checkout_timeout", &self.checkout_timeout)
            .finish()
    }
}

// =============================================================================
// Cancellation
// =============================================================================

enum CancelState {
    Idle,
    Running(InterruptHandle),
    Cancelled,
}

/// Cancels one query, and only that query.
///
/// The interrupt handle is installed when the query checks out a connection
/// and removed, under the same lock, before the connection goes back to the
/// pool. A late [`cancel`](Self::cancel) therefore never reaches a statement
/// that belongs to another request.
pub struct QueryCancel {
    state: Mutex<CancelState>,
}

impl QueryCancel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CancelState::Idle),
        }
    }

    /// Interrupt the query if it is running, and stop it from starting
    /// otherwise.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if let CancelState::Running(handle) = &*state {
            handle.interrupt();
        }
        *state = CancelState::Cancelled;
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.lock(), CancelState::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), CancelState::Running(_))
    }

    /// Attach to `conn` for the duration of a query; `None` if already
    /// cancelled. The returned guard must be dropped before the connection
    /// is returned to the pool.
    pub(crate) fn attach(&self, conn: &Connection) -> Option<Attached<'_>> {
        let mut state = self.lock();
        if matches!(*state, CancelState::Cancelled) {
            return None;
        }
        *state = CancelState::Running(conn.get_interrupt_handle());
        Some(Attached(self))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Detaches a [`QueryCancel`] from its connection when dropped.
pub(crate) struct Attached<'a>(&'a QueryCancel);

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        if matches!(*state, CancelState::Running(_)) {
            *state = CancelState::Idle;
        }
    }
}

impl Default for QueryCancel {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TilesetConnection
// =============================================================================

/// Open, read-only database handles for one tileset.
///
/// Queries check a connection out of a small bounded pool, so requests for
/// the same tileset run side by side. SQLite calls are blocking and must be
/// made from a blocking thread. Once released, the handle refuses further
/// queries with [`TileError::ConnectionReleased`].
pub struct TilesetConnection {
    name: String,
    uri: String,
    pool: Mutex<Option<Pool<VfsConnectionManager>>>,
    vfs: Arc<StorageVfs>,
}

impl TilesetConnection {
    /// Open `uri` through `vfs`. Blocking.
    ///
    /// The database header is read before returning, so a missing or
    /// malformed object fails here rather than on the first tile request.
    /// Pooled connections are opened on demand after that.
    pub fn open(
        name: impl Into<String>,
        uri: impl Into<String>,
        vfs: Arc<StorageVfs>,
        options: &PoolOptions,
    ) -> Result<Self, TileError> {
        let name = name.into();
        let uri = uri.into();

        let first = open_read_only(&name, &uri, &vfs)?;
        let schema_version: i64 = first
            .query_row("PRAGMA schema_version", [], |row| row.get(0))
            .map_err(|e| classify(&vfs, &uri, e))?;
        drop(first);

        let manager = VfsConnectionManager {
            name: name.clone(),
            uri: uri.clone(),
            vfs: vfs.clone(),
        };
        let pool = Pool::builder()
            .max_size(options.max_size.max(1) as u32)
            .min_idle(Some(0))
            .connection_timeout(options.checkout_timeout)
            .test_on_check_out(false)
            .error_handler(Box::new(LogConnectErrors {
                tileset: name.clone(),
            }))
            .thread_pool(options.workers.clone())
            .build_unchecked(manager);

        debug!(
            tileset = %name,
            uri = %uri,
            schema_version,
            pool_size = options.max_size,
            "opened tileset database"
        );

        Ok(Self {
            name,
            uri,
            pool: Mutex::new(Some(pool)),
            vfs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Run `f` on a pooled connection. Blocking.
    ///
    /// Storage failures raised while SQLite was reading pages are surfaced
    /// as [`TileError::Storage`] rather than a generic database error.
    pub fn run<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, TileError> {
        self.run_cancellable(&QueryCancel::new(), f)
    }

    /// Like [`run`](Self::run), interruptible through `cancel`.
    pub fn run_cancellable<T>(
        &self,
        cancel: &QueryCancel,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, TileError> {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TileError::ConnectionReleased(self.name.clone()))?;

        let conn = pool.get().map_err(|e| {
            TileError::Storage(StorageError::Transient(format!(
                "no connection to {} available: {}",
                self.uri, e
            )))
        })?;

        // Declared after `conn` so it detaches before the connection returns
        let Some(_attached) = cancel.attach(&conn) else {
            return Err(interrupted(&self.uri));
        };

        // Drop anything left over from an earlier failed statement
        self.vfs.take_error(&self.uri);
        f(&conn).map_err(|e| classify(&self.vfs, &self.uri, e))
    }

    /// Look up one tile. Blocking.
    pub fn query_tile(&self, key: &RowKey) -> Result<Option<Bytes>, TileError> {
        self.run(|conn| select_tile(conn, key))
    }

    /// Read the `metadata` table. Blocking.
    pub fn query_metadata(&self) -> Result<HashMap<String, String>, TileError> {
        self.run(select_metadata)
    }

    /// Close the pool.
    ///
    /// Idle connections close now; connections still running a query close
    /// as soon as it finishes. New queries fail with
    /// [`TileError::ConnectionReleased`].
    pub fn release(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(pool) = pool {
            let state = pool.state();
            drop(pool);
            debug!(
                tileset = %self.name,
                idle = state.idle_connections,
                busy = state.connections - state.idle_connections,
                "released tileset database"
            );
        }
    }

    pub fn is_released(&self) -> bool {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Connections currently open in the pool, idle or busy.
    pub fn open_connections(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |pool| pool.state().connections as usize)
    }
}

impl fmt::Debug for TilesetConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TilesetConnection")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .finish()
    }
}

/// Open one read-only connection with the query pragmas applied.
fn open_read_only(name: &str, uri: &str, vfs: &StorageVfs) -> Result<Connection, TileError> {
    vfs.take_error(uri);

    let conn = Connection::open_with_flags_and_vfs(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        vfs.name(),
    )
    .map_err(|e| classify(vfs, uri, e))?;

    conn.execute_batch("PRAGMA query_only = ON; PRAGMA temp_store = MEMORY;")
        .map_err(|e| classify(vfs, uri, e))?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

    debug!(tileset = name, uri, "opened read connection");
    Ok(conn)
}

fn interrupted(uri: &str) -> TileError {
    TileError::Task(format!("query on {} interrupted", uri))
}

/// Prefer the storage error recorded by the VFS over SQLite's I/O code.
fn classify(vfs: &StorageVfs, uri: &str, err: rusqlite::Error) -> TileError {
    if let Some(storage) = vfs.take_error(uri) {
        return TileError::Storage(storage);
    }

    if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        return interrupted(uri);
    }

    TileError::from(err)
}

/// Select the tile addressed by `key`; at most one row is read.
pub fn select_tile(conn: &Connection, key: &RowKey) -> rusqlite::Result<Option<Bytes>> {
    let data: Option<Vec<u8>> = match key {
        RowKey::Tms { zoom, column, row } => conn
            .prepare_cached(TMS_TILE_QUERY)?
            .query_row(params![zoom, column, row], |row| row.get(0))
            .optional()?,
        RowKey::Quadkey(quadkey) => conn
            .prepare_cached(QUADKEY_TILE_QUERY)?
            .query_row(params![quadkey], |row| row.get(0))
            .optional()?,
    };

    Ok(data.map(Bytes::from))
}

/// Read every `name`/`value` pair from the `metadata` table.
///
/// Values of any storage class are rendered as text; rows without a name
/// are skipped.
pub fn select_metadata(conn: &Connection) -> rusqlite::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare_cached(METADATA_QUERY)?;
    let mut rows = stmt.query([])?;
    let mut metadata = HashMap::new();

    while let Some(row) = rows.next()? {
        let Some(name) = value_to_string(row.get_ref(0)?) else {
            continue;
        };
        let value = value_to_string(row.get_ref(1)?).unwrap_or_default();
        metadata.insert(name, value);
    }

    Ok(metadata)
}

fn value_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}
