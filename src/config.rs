//! Configuration management for MBTiles Streamer.
//!
//! This module provides a flexible configuration system that supports:
//! - Command-line arguments via clap
//! - Environment variables with `MBTILES_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use mbtiles_streamer::config::{Cli, Command};
//!
//! match Cli::parse().command {
//!     Command::Serve(config) => println!("Listening on {}", config.bind_address()),
//!     Command::Check(config) => println!("Checking {}", config.storage.bucket),
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `MBTILES_HOST` - Server bind address (default: 0.0.0.0)
//! - `PORT` - Server port (default: 8080)
//! - `MBTILES_SCHEME` - Storage scheme: s3, gs or file (default: s3)
//! - `MBTILES_BUCKET` - Bucket holding the tilesets (required)
//! - `MBTILES_PREFIX` - Key prefix for tilesets (default: tilesets)
//! - `MBTILES_EXTENSION` - Tileset file extension (default: mbtiles)
//! - `MBTILES_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `MBTILES_S3_REGION` - AWS region (default: us-east-1)
//! - `MBTILES_GCS_ENDPOINT` - GCS interoperability endpoint
//! - `MBTILES_FILE_ROOT` - Root directory for the `file` scheme
//! - `MBTILES_CHUNK_SIZE` - Range read granularity in bytes (default: 98304)
//! - `MBTILES_CHUNK_CACHE` - Chunks to keep in memory (default: 128)
//! - `MBTILES_TILESET_CACHE` - Open tilesets to keep (default: 20)
//! - `MBTILES_TILESET_POOL_SIZE` - Read connections per tileset (default: 4)
//! - `MBTILES_ADDRESSING` - tms or quadkey (default: tms)
//! - `MBTILES_PUBLIC_URL` - Tile URL template advertised in TileJSON
//! - `MBTILES_CACHE_MAX_AGE` - HTTP cache max-age seconds (default: 3600)
//! - `MBTILES_CORS_ORIGINS` - Allowed CORS origins (comma-separated)

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::server::{DEFAULT_TILE_URL, TILESET_PLACEHOLDER};
use crate::storage::{
    DEFAULT_CHUNK_CACHE_CAPACITY, DEFAULT_CHUNK_SIZE, DEFAULT_READ_TIMEOUT, DEFAULT_SIZE_TIMEOUT,
};
use crate::tile::AddressingScheme;
use crate::tileset::{
    DEFAULT_EXTENSION, DEFAULT_POOL_SIZE, DEFAULT_PREFIX, DEFAULT_TILESET_CACHE_CAPACITY,
};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default storage scheme.
pub const DEFAULT_SCHEME: &str = "s3";

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default HTTP cache max-age in seconds (1 hour).
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

/// SQLite page granularity; chunk sizes must be a multiple of it.
pub const PAGE_ALIGNMENT: usize = 4096;

/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Most read connections a single tileset may hold.
pub const MAX_POOL_SIZE: usize = 64;

/// Storage schemes with a built-in backend.
pub const SUPPORTED_SCHEMES: [&str; 3] = ["s3", "gs", "file"];

// =============================================================================
// CLI Arguments
// =============================================================================

/// MBTiles Streamer - A tile server for MBTiles databases in object storage.
///
/// Serves map tiles straight out of SQLite databases stored in S3, GCS or a
/// local directory, fetching only the pages each query touches.
#[derive(Parser, Debug, Clone)]
#[command(name = "mbtiles-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the tile server
    Serve(ServeConfig),

    /// Verify storage access and optionally open a tileset
    Check(CheckConfig),
}

/// Where tilesets live.
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Storage scheme: s3, gs or file.
    #[arg(long, default_value = DEFAULT_SCHEME, env = "MBTILES_SCHEME")]
    pub scheme: String,

    /// Bucket containing the tilesets.
    #[arg(long, env = "MBTILES_BUCKET")]
    pub bucket: String,

    /// Key prefix under which tilesets are stored.
    #[arg(long, default_value = DEFAULT_PREFIX, env = "MBTILES_PREFIX")]
    pub prefix: String,

    /// Tileset file extension.
    #[arg(long, default_value = DEFAULT_EXTENSION, env = "MBTILES_EXTENSION")]
    pub extension: String,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    ///
    /// If not specified, uses the default AWS S3 endpoint.
    #[arg(long, env = "MBTILES_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "MBTILES_S3_REGION")]
    pub s3_region: String,

    /// GCS interoperability endpoint (defaults to storage.googleapis.com).
    #[arg(long, env = "MBTILES_GCS_ENDPOINT")]
    pub gcs_endpoint: Option<String>,

    /// Root directory for the `file` scheme; buckets are subdirectories.
    #[arg(long, default_value = ".", env = "MBTILES_FILE_ROOT")]
    pub file_root: String,

    /// Timeout in seconds for object size lookups.
    #[arg(long, default_value_t = DEFAULT_SIZE_TIMEOUT.as_secs(), env = "MBTILES_SIZE_TIMEOUT")]
    pub size_timeout: u64,

    /// Timeout in seconds for a whole range read.
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT.as_secs(), env = "MBTILES_READ_TIMEOUT")]
    pub read_timeout: u64,
}

impl StorageArgs {
    /// Validate the storage settings.
    pub fn validate(&self) -> Result<(), String> {
        if !SUPPORTED_SCHEMES.contains(&self.scheme.as_str()) {
            return Err(format!(
                "Unsupported storage scheme '{}'. Expected one of: {}",
                self.scheme,
                SUPPORTED_SCHEMES.join(", ")
            ));
        }

        if self.bucket.is_empty() {
            return Err("Bucket name is required. Set --bucket or MBTILES_BUCKET".to_string());
        }

        if self.size_timeout == 0 || self.read_timeout == 0 {
            return Err("Storage timeouts must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn size_timeout(&self) -> Duration {
        Duration::from_secs(self.size_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }
}

/// Configuration for the `serve` command.
#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "MBTILES_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "PORT")]
    pub port: u16,

    // =========================================================================
    // Storage Configuration
    // =========================================================================
    #[command(flatten)]
    pub storage: StorageArgs,

    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Range read granularity in bytes (a multiple of 4096).
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "MBTILES_CHUNK_SIZE")]
    pub chunk_size: usize,

    /// Maximum number of chunks to keep in memory.
    #[arg(long, default_value_t = DEFAULT_CHUNK_CACHE_CAPACITY, env = "MBTILES_CHUNK_CACHE")]
    pub chunk_cache_capacity: usize,

    /// Maximum number of open tileset databases.
    #[arg(long, default_value_t = DEFAULT_TILESET_CACHE_CAPACITY, env = "MBTILES_TILESET_CACHE")]
    pub tileset_cache_capacity: usize,

    /// Read connections per open tileset; queries beyond this wait.
    #[arg(long, default_value_t = DEFAULT_POOL_SIZE, env = "MBTILES_TILESET_POOL_SIZE")]
    pub tileset_pool_size: usize,

    // =========================================================================
    // Tile Configuration
    // =========================================================================
    /// How rows of the tiles table are keyed.
    #[arg(long, value_enum, default_value_t = AddressingScheme::Tms, env = "MBTILES_ADDRESSING")]
    pub addressing: AddressingScheme,

    /// Tile URL template advertised in TileJSON; `{tileset}` is substituted.
    #[arg(long, default_value = DEFAULT_TILE_URL, env = "MBTILES_PUBLIC_URL")]
    pub public_url: String,

    /// HTTP Cache-Control max-age in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "MBTILES_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "MBTILES_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;

        if self.chunk_size < PAGE_ALIGNMENT
            || self.chunk_size > MAX_CHUNK_SIZE
            || self.chunk_size % PAGE_ALIGNMENT != 0
        {
            return Err(format!(
                "chunk_size must be a multiple of {} between 4KB and 16MB, got {}",
                PAGE_ALIGNMENT, self.chunk_size
            ));
        }

        if self.chunk_cache_capacity == 0 {
            return Err("chunk_cache_capacity must be greater than 0".to_string());
        }
        if self.tileset_cache_capacity == 0 {
            return Err("tileset_cache_capacity must be greater than 0".to_string());
        }
        if self.tileset_pool_size == 0 || self.tileset_pool_size > MAX_POOL_SIZE {
            return Err(format!(
                "tileset_pool_size must be between 1 and {}",
                MAX_POOL_SIZE
            ));
        }

        if !self.public_url.contains(TILESET_PLACEHOLDER) {
            return Err(format!(
                "public_url must contain the {} placeholder",
                TILESET_PLACEHOLDER
            ));
        }
        let sample = self.public_url.replace(TILESET_PLACEHOLDER, "sample");
        url::Url::parse(&sample).map_err(|e| format!("public_url is not a valid URL: {}", e))?;

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for the `check` command.
#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Open this tileset and print its metadata.
    #[arg(long)]
    pub tileset: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CheckConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
