//! HTTP server layer.
//!
//! This module provides the HTTP API for serving tiles out of MBTiles
//! databases in object storage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │   GET /tile/{tileset}/{z}/{x}/{y}.{format}                      │
//! │   GET /tile/{tileset}.json                                      │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  handlers   │  │  tilejson   │  │        routes           │  │
//! │  │ (requests)  │  │ (metadata)  │  │  (router config)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod handlers;
pub mod routes;
pub mod tilejson;

pub use handlers::{
    content_type_for, health_handler, is_gzipped, tile_handler, tilejson_handler, AppState,
    ErrorResponse, HandlerError, HealthResponse, TilePathParams, TILESET_PLACEHOLDER,
};
pub use routes::{create_router, RouterConfig, DEFAULT_TILE_URL};
pub use tilejson::{TileJson, VectorLayer, TILEJSON_VERSION};
