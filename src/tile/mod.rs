//! Tile service layer.
//!
//! This module turns `(tileset, z, x, y)` requests into database lookups.
//!
//! # Components
//!
//! - [`TileService`]: Main entry point for tile and metadata requests
//! - [`AddressingScheme`]: How tile rows are keyed (TMS rows or quadkeys)
//! - [`TileCoordinate`]: A tile address in XYZ convention
//! - [`flip_row`], [`quadkey`]: The underlying coordinate translations
//!
//! # Example
//!
//! ```
//! use mbtiles_streamer::tile::{flip_row, quadkey, TileCoordinate};
//!
//! // XYZ row 1 at zoom 2 is TMS row 2
//! assert_eq!(flip_row(2, 1), Some(2));
//!
//! // Quadkeys have one digit per zoom level
//! assert_eq!(quadkey(TileCoordinate::new(3, 3, 5)), "213");
//! ```

mod addressing;
mod service;

pub use addressing::{
    flip_row, quadkey, quadkey_to_tile, tms_row, AddressingScheme, RowKey, TileCoordinate,
};
pub use service::TileService;
