//! HTTP request handlers for the tile API.
//!
//! This module contains the Axum handlers for serving tiles, TileJSON and
//! health checks.
//!
//! # Endpoints
//!
//! - `GET /tile/{tileset}/{z}/{x}/{y}.{format}` - Serve a tile
//! - `GET /tile/{tileset}.json` - TileJSON for a tileset
//! - `GET /health` - Health check endpoint

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{StorageError, TileError};
use crate::tile::TileService;

use super::tilejson::TileJson;

/// Placeholder for the tileset name in the public tile URL template.
pub const TILESET_PLACEHOLDER: &str = "{tileset}";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state containing the tile service.
///
/// This is passed to all handlers via Axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    /// The tile service for processing tile requests
    pub tile_service: Arc<TileService>,

    /// Cache-Control max-age in seconds (defaults to 1 hour)
    pub cache_max_age: u32,

    /// Public tile URL template advertised in TileJSON
    pub tile_url_template: String,
}

impl AppState {
    /// Create a new application state with the given tile service.
    pub fn new(tile_service: TileService, tile_url_template: impl Into<String>) -> Self {
        Self {
            tile_service: Arc::new(tile_service),
            cache_max_age: 3600,
            tile_url_template: tile_url_template.into(),
        }
    }

    /// Set the Cache-Control max-age.
    pub fn with_cache_max_age(mut self, cache_max_age: u32) -> Self {
        self.cache_max_age = cache_max_age;
        self
    }

    /// Tile URL advertised for a tileset.
    pub fn tile_url(&self, tileset: &str) -> String {
        self.tile_url_template.replace(TILESET_PLACEHOLDER, tileset)
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Path parameters for tile requests.
///
/// Extracted from: `/tile/{tileset}/{z}/{x}/{filename}`
/// where filename is `{y}.{format}`
#[derive(Debug, Deserialize)]
pub struct TilePathParams {
    pub tileset: String,
    pub z: String,
    pub x: String,
    pub filename: String,
}

impl TilePathParams {
    /// Parse zoom, column, row and format.
    pub fn parse(&self) -> Result<(u32, u32, u32, String), TileError> {
        let invalid = |what: &str, value: &str| {
            TileError::InvalidRequest(format!("invalid {}: {:?}", what, value))
        };

        let z = self.z.parse().map_err(|_| invalid("zoom", &self.z))?;
        let x = self.x.parse().map_err(|_| invalid("column", &self.x))?;

        let (y, format) = self
            .filename
            .split_once('.')
            .ok_or_else(|| invalid("tile filename", &self.filename))?;
        let y = y.parse().map_err(|_| invalid("row", y))?;

        if format.is_empty() {
            return Err(invalid("format", format));
        }

        Ok((z, x, y, format.to_ascii_lowercase()))
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "tile_not_found", "invalid_request")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    /// Create a new error response.
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Create a new error response with status code.
    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Convert TileError to HTTP response.
///
/// This implementation logs errors appropriately based on their severity:
/// - 404s are logged at DEBUG level (common and expected)
/// - other 4xx errors are logged at WARN level (client errors)
/// - 5xx errors are logged at ERROR level (server errors)
impl IntoResponse for TileError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            TileError::TilesetNotFound { .. } => (StatusCode::NOT_FOUND, "tileset_not_found"),
            TileError::TileNotFound { .. } => (StatusCode::NOT_FOUND, "tile_not_found"),
            TileError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            TileError::Storage(StorageError::TruncatedRead { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "truncated_read")
            }
            TileError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            TileError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            TileError::ConnectionReleased(_) | TileError::Task(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
        let message = self.to_string();

        // Log errors based on severity
        if status.is_server_error() {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                "Server error: {}",
                message
            );
        } else if status == StatusCode::NOT_FOUND {
            debug!(
                error_type = error_type,
                status = status.as_u16(),
                "Resource not found: {}",
                message
            );
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                message
            );
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);

        (status, Json(error_response)).into_response()
    }
}

/// Wrapper for handler errors to implement IntoResponse.
pub struct HandlerError(pub TileError);

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        self.0.into_response()
    }
}

impl From<TileError> for HandlerError {
    fn from(err: TileError) -> Self {
        HandlerError(err)
    }
}

// =============================================================================
// Content Negotiation
// =============================================================================

/// Content type for a tile format suffix.
pub fn content_type_for(format: &str) -> &'static str {
    match format {
        "pbf" | "mvt" => "application/x-protobuf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "json" | "geojson" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Whether a payload carries gzip framing.
pub fn is_gzipped(data: &[u8]) -> bool {
    data.starts_with(&[0x1f, 0x8b])
}

// =============================================================================
// Handlers
// =============================================================================

/// Handle tile requests.
///
/// # Endpoint
///
/// `GET /tile/{tileset}/{z}/{x}/{y}.{format}`
///
/// # Response
///
/// - `200 OK`: Raw tile bytes
/// - `400 Bad Request`: Malformed coordinates or filename
/// - `404 Not Found`: Tileset or tile not found
/// - `500 Internal Server Error`: Storage or database failure
///
/// # Headers
///
/// - `Content-Type` from the format suffix
/// - `Content-Encoding: gzip` for gzip-framed vector tiles
/// - `Cache-Control: public, max-age={cache_max_age}`
pub async fn tile_handler(
    State(state): State<AppState>,
    Path(params): Path<TilePathParams>,
) -> Result<Response, HandlerError> {
    let (z, x, y, format) = params.parse()?;

    let data = state
        .tile_service
        .resolve_tile(&params.tileset, z, x, y)
        .await?;

    let content_type = content_type_for(&format);
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CACHE_CONTROL,
            format!("public, max-age={}", state.cache_max_age),
        );

    if content_type == "application/x-protobuf" && is_gzipped(&data) {
        builder = builder.header(header::CONTENT_ENCODING, "gzip");
    }

    builder
        .body(Body::from(data))
        .map_err(|e| HandlerError(TileError::Task(e.to_string())))
}

/// Handle TileJSON requests.
///
/// # Endpoint
///
/// `GET /tile/{tileset}.json`
///
/// # Response
///
/// `200 OK` with a TileJSON 3.0.0 document built from the tileset's
/// `metadata` table. `404 Not Found` if the tileset does not exist.
pub async fn tilejson_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, HandlerError> {
    let tileset = filename.strip_suffix(".json").ok_or_else(|| {
        HandlerError(TileError::TilesetNotFound {
            tileset: filename.clone(),
        })
    })?;

    let metadata = state.tile_service.resolve_metadata(tileset).await?;
    let tilejson = TileJson::from_mbtiles(state.tile_url(tileset), &metadata);

    Ok((
        [(
            header::CACHE_CONTROL,
            format!("public, max-age={}", state.cache_max_age),
        )],
        Json(tilejson),
    )
        .into_response())
}

/// Handle health check requests.
///
/// # Endpoint
///
/// `GET /health`
///
/// # Response
///
/// `200 OK` with JSON body:
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0"
/// }
/// ```
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
