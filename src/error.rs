use thiserror::Error;

/// Errors raised by the storage layer: backends, chunk cache, remote files and the VFS.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// No backend is registered for the URI scheme
    #[error("Unsupported storage scheme: {0}")]
    UnsupportedScheme(String),

    /// The URI could not be split into scheme, bucket and key
    #[error("Invalid storage URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Network, timeout or provider failure
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// The backend delivered fewer bytes than the requested range implies
    #[error(
        "Truncated read from {uri}: expected {expected} bytes at offset {offset}, got {actual}"
    )]
    TruncatedRead {
        uri: String,
        offset: u64,
        expected: u64,
        actual: u64,
    },

    /// Requested range exceeds object bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Any attempted mutation of a read-only object
    #[error("Read-only violation: {0} is not permitted")]
    ReadOnlyViolation(&'static str),

    /// SQLite refused to register the VFS
    #[error("VFS registration failed: {0}")]
    Registration(String),
}

impl StorageError {
    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Errors returned by the tile service.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// The tileset's backing object is absent or inaccessible
    #[error("Tileset not found: {tileset}")]
    TilesetNotFound { tileset: String },

    /// The row lookup produced no match
    #[error("Tile not found: {tileset}/{z}/{x}/{y}")]
    TileNotFound {
        tileset: String,
        z: u32,
        x: u32,
        y: u32,
    },

    /// Malformed request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Storage failure surfaced while SQLite was reading pages
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// SQLite reported an error that was not caused by storage
    #[error("Database error: {0}")]
    Database(String),

    /// The handle was released by eviction while the request held it
    #[error("Connection for tileset {0} has been released")]
    ConnectionReleased(String),

    /// A blocking worker panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Task(String),
}

impl TileError {
    /// Whether the error maps to a not-found outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TileError::TilesetNotFound { .. } | TileError::TileNotFound { .. }
        )
    }
}

impl From<rusqlite::Error> for TileError {
    fn from(err: rusqlite::Error) -> Self {
        TileError::Database(err.to_string())
    }
}
