//! Router configuration for the tile server.
//!
//! This module defines the HTTP routes and applies middleware for CORS and
//! request tracing.
//!
//! # Route Structure
//!
//! ```text
//! /health                                  - Health check
//! /tile/{tileset}.json                     - TileJSON
//! /tile/{tileset}/{z}/{x}/{y}.{format}     - Tile endpoint
//! ```
//!
//! # Example
//!
//! ```ignore
//! use mbtiles_streamer::server::{create_router, RouterConfig};
//! use mbtiles_streamer::tile::{AddressingScheme, TileService};
//!
//! let tile_service = TileService::new(registry, AddressingScheme::Tms);
//!
//! let config = RouterConfig::new("https://tiles.example.com/tile/{tileset}/{z}/{x}/{y}.mvt")
//!     .with_cors_origins(vec!["https://example.com".to_string()]);
//!
//! let router = create_router(tile_service, config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::time::Duration;

use axum::{routing::get, Router};
use http::header::CONTENT_TYPE;
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{health_handler, tile_handler, tilejson_handler, AppState};
use crate::tile::TileService;

/// Default public tile URL template.
pub const DEFAULT_TILE_URL: &str = "http://localhost:8080/tile/{tileset}/{z}/{x}/{y}.mvt";

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Clone)]
pub struct RouterConfig {
    /// Tile URL template advertised in TileJSON, with a `{tileset}` placeholder
    pub tile_url_template: String,

    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_URL)
    }
}

impl RouterConfig {
    /// Create a new router configuration advertising `tile_url_template`.
    ///
    /// By default:
    /// - CORS allows any origin
    /// - Cache max-age is 1 hour (3600 seconds)
    /// - Tracing is enabled
    pub fn new(tile_url_template: impl Into<String>) -> Self {
        Self {
            tile_url_template: tile_url_template.into(),
            cors_origins: None,
            cache_max_age: 3600,
            enable_tracing: true,
        }
    }

    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    /// Pass None (or don't call this method) to allow any origin.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Allow any CORS origin.
    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    /// Set the Cache-Control max-age in seconds.
    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the main application router.
///
/// # Arguments
///
/// * `tile_service` - The tile service for handling tile requests
/// * `config` - Router configuration
///
/// # Returns
///
/// A configured Axum router ready to be served.
pub fn create_router(tile_service: TileService, config: RouterConfig) -> Router {
    let app_state = AppState::new(tile_service, config.tile_url_template.clone())
        .with_cache_max_age(config.cache_max_age);

    let cors = build_cors_layer(&config);

    // `{tileset}.json` cannot be expressed as a route segment, so the
    // single-segment route carries the full filename
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/tile/{tileset}", get(tilejson_handler))
        .route("/tile/{tileset}/{z}/{x}/{filename}", get(tile_handler))
        .with_state(app_state)
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(86400)); // 24 hours

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => {
            // No origins allowed - this effectively disables CORS
            cors
        }
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
