//! MBTiles Streamer - A tile server for MBTiles databases in object storage.
//!
//! This binary starts the HTTP server and configures all components.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mbtiles_streamer::{
    config::{CheckConfig, Cli, Command, ServeConfig, StorageArgs},
    server::{create_router, RouterConfig},
    storage::{
        create_gcs_client, create_s3_client, BackendRegistry, ChunkCache, FsBackend, S3Backend,
        StorageBackend, DEFAULT_CHUNK_CACHE_CAPACITY, DEFAULT_CHUNK_SIZE,
    },
    tile::TileService,
    tileset::{
        PoolOptions, TilesetConnectionCache, TilesetLocation, DEFAULT_TILESET_CACHE_CAPACITY,
    },
    vfs::StorageVfs,
    TileError,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(config) => run_serve(config).await,
        Command::Check(config) => run_check(config).await,
    }
}

// =============================================================================
// Shared Setup
// =============================================================================

/// Build the backend for the configured storage scheme.
async fn build_backend(storage: &StorageArgs) -> Arc<dyn StorageBackend> {
    let (size_timeout, read_timeout) = (storage.size_timeout(), storage.read_timeout());

    match storage.scheme.as_str() {
        "gs" => {
            let client =
                create_gcs_client(storage.gcs_endpoint.as_deref(), &storage.s3_region).await;
            Arc::new(S3Backend::gcs(client).with_timeouts(size_timeout, read_timeout))
        }
        "file" => {
            Arc::new(FsBackend::new(&storage.file_root).with_timeouts(size_timeout, read_timeout))
        }
        _ => {
            let client =
                create_s3_client(storage.s3_endpoint.as_deref(), &storage.s3_region).await;
            Arc::new(S3Backend::new(client).with_timeouts(size_timeout, read_timeout))
        }
    }
}

/// Wire backend, chunk cache, VFS and connection cache together.
async fn build_tileset_cache(
    storage: &StorageArgs,
    chunk_size: usize,
    chunk_cache_capacity: usize,
    tileset_cache_capacity: usize,
    pool_size: usize,
) -> Result<TilesetConnectionCache, String> {
    let backends = BackendRegistry::new().with_backend(build_backend(storage).await);
    let cache = Arc::new(ChunkCache::with_capacity(chunk_cache_capacity));

    let vfs = StorageVfs::new(
        backends,
        cache,
        chunk_size,
        tokio::runtime::Handle::current(),
    )
    .register()
    .map_err(|e| e.to_string())?;

    let location = TilesetLocation::new(&storage.scheme, &storage.bucket)
        .with_prefix(&storage.prefix)
        .with_extension(&storage.extension);

    Ok(
        TilesetConnectionCache::with_capacity(vfs, location, tileset_cache_capacity)
            .with_pool_options(PoolOptions::new(pool_size)),
    )
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "mbtiles_streamer=debug,tower_http=debug"
    } else {
        "mbtiles_streamer=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let storage = &config.storage;
    info!("MBTiles Streamer v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!(
        "  Tilesets: {}://{}/{}/<name>.{}",
        storage.scheme, storage.bucket, storage.prefix, storage.extension
    );
    if let Some(ref endpoint) = storage.s3_endpoint {
        info!("  S3 endpoint: {}", endpoint);
    }
    info!("  Addressing: {}", config.addressing);
    info!(
        "  Cache: {} chunks of {}KB, {} tilesets of up to {} connections",
        config.chunk_cache_capacity,
        config.chunk_size / 1024,
        config.tileset_cache_capacity,
        config.tileset_pool_size
    );
    info!("  Public URL: {}", config.public_url);

    let tilesets = match build_tileset_cache(
        storage,
        config.chunk_size,
        config.chunk_cache_capacity,
        config.tileset_cache_capacity,
        config.tileset_pool_size,
    )
    .await
    {
        Ok(tilesets) => tilesets,
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let tile_service = TileService::new(Arc::new(tilesets), config.addressing);
    let router = create_router(tile_service, build_router_config(&config));

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("Server listening on: http://{}", addr);
    info!("  curl http://{}/health", addr);
    info!("  curl http://{}/tile/<tileset>.json", addr);

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Build RouterConfig from the application ServeConfig.
fn build_router_config(config: &ServeConfig) -> RouterConfig {
    let mut router_config =
        RouterConfig::new(&config.public_url).with_cache_max_age(config.cache_max_age);

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config.with_tracing(!config.no_tracing)
}

// =============================================================================
// Check Command
// =============================================================================

async fn run_check(config: CheckConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    println!("MBTiles Streamer Configuration Check");
    println!("════════════════════════════════════");
    println!();

    if let Err(e) = config.validate() {
        println!("✗ Configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let storage = &config.storage;
    println!("✓ Scheme: {}", storage.scheme);
    println!("✓ Bucket: {}", storage.bucket);
    println!("✓ Prefix: {}", storage.prefix);
    if let Some(ref endpoint) = storage.s3_endpoint {
        println!("✓ Endpoint: {}", endpoint);
    }

    let tilesets = match build_tileset_cache(
        storage,
        DEFAULT_CHUNK_SIZE,
        DEFAULT_CHUNK_CACHE_CAPACITY,
        DEFAULT_TILESET_CACHE_CAPACITY,
        1,
    )
    .await
    {
        Ok(tilesets) => tilesets,
        Err(e) => {
            println!("✗ Storage: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("✓ VFS registered: {}", tilesets.vfs().name());

    if let Some(ref name) = config.tileset {
        println!();
        println!(
            "Opening tileset '{}' ({})...",
            name,
            tilesets.location().uri_for(name)
        );

        let metadata = match check_tileset(&tilesets, name).await {
            Ok(metadata) => metadata,
            Err(e) => {
                println!("✗ {}", e);
                return ExitCode::FAILURE;
            }
        };

        println!("✓ opened");
        let mut keys: Vec<_> = metadata.keys().collect();
        keys.sort();
        for key in keys {
            let value = &metadata[key];
            let shown: String = value.chars().take(60).collect();
            println!("  {}: {}", key, shown);
        }

        let stats = tilesets.vfs().chunk_cache().stats();
        println!();
        println!("  Chunks fetched: {}", stats.misses);
    }

    println!();
    println!("════════════════════════════════════");
    println!("✓ All checks passed!");

    ExitCode::SUCCESS
}

async fn check_tileset(
    tilesets: &TilesetConnectionCache,
    name: &str,
) -> Result<std::collections::HashMap<String, String>, TileError> {
    let conn = tilesets.get_or_open(name).await?;
    tokio::task::spawn_blocking(move || conn.query_metadata())
        .await
        .map_err(|e| TileError::Task(e.to_string()))?
}
