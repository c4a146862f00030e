//! Tile coordinate translation.
//!
//! Requests arrive in XYZ convention (row 0 at the top). MBTiles stores rows
//! in TMS convention (row 0 at the bottom), so the row has to be flipped
//! before lookup. Some tilesets instead key tiles by Bing-style quadkey.

use std::fmt;

use clap::ValueEnum;

/// Highest zoom at which `2^z` still fits in an `i64` row.
const MAX_FLIPPABLE_ZOOM: u32 = 62;

/// A tile address in XYZ convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoordinate {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoordinate {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Flip a row between XYZ and TMS conventions: `2^z - row - 1`.
///
/// The flip is its own inverse. Returns `None` at zooms where `2^z` is not
/// representable; rows outside `0..2^z` are flipped arithmetically and
/// simply match nothing.
pub fn flip_row(z: u32, row: i64) -> Option<i64> {
    if z > MAX_FLIPPABLE_ZOOM {
        return None;
    }
    (1i64 << z).checked_sub(row)?.checked_sub(1)
}

/// TMS row for an XYZ coordinate.
pub fn tms_row(coord: TileCoordinate) -> Option<i64> {
    flip_row(coord.z, i64::from(coord.y))
}

/// Quadkey for an XYZ coordinate: `z` base-4 digits, most significant first.
///
/// Digit `i` (counting from 1) combines bit `z - i` of x (value 1) and of y
/// (value 2). Zoom 0 yields the empty string.
pub fn quadkey(coord: TileCoordinate) -> String {
    let mut key = String::with_capacity(coord.z as usize);

    for i in (1..=coord.z).rev() {
        let mask = 1u64 << (i - 1);
        let mut digit = b'0';
        if u64::from(coord.x) & mask != 0 {
            digit += 1;
        }
        if u64::from(coord.y) & mask != 0 {
            digit += 2;
        }
        key.push(digit as char);
    }

    key
}

/// Decode a quadkey back into an XYZ coordinate.
///
/// Returns `None` for digits outside `0..=3` or keys longer than 32 digits.
pub fn quadkey_to_tile(key: &str) -> Option<TileCoordinate> {
    if key.len() > 32 {
        return None;
    }

    let (mut x, mut y) = (0u32, 0u32);
    for c in key.chars() {
        let digit = c.to_digit(4)?;
        x = (x << 1) | (digit & 1);
        y = (y << 1) | (digit >> 1);
    }

    Some(TileCoordinate::new(key.len() as u32, x, y))
}

// =============================================================================
// Addressing Scheme
// =============================================================================

/// How tiles are keyed in the `tiles` table. One scheme per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AddressingScheme {
    /// `zoom_level`, `tile_column`, `tile_row` with TMS rows
    #[default]
    Tms,
    /// A single `quadkey` column
    Quadkey,
}

impl AddressingScheme {
    /// Compute the row-selection key for a coordinate.
    ///
    /// Returns `None` when the coordinate cannot address any row.
    pub fn row_key(self, coord: TileCoordinate) -> Option<RowKey> {
        match self {
            AddressingScheme::Tms => Some(RowKey::Tms {
                zoom: i64::from(coord.z),
                column: i64::from(coord.x),
                row: tms_row(coord)?,
            }),
            AddressingScheme::Quadkey => {
                if coord.z > 32 {
                    return None;
                }
                Some(RowKey::Quadkey(quadkey(coord)))
            }
        }
    }
}

impl fmt::Display for AddressingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressingScheme::Tms => write!(f, "tms"),
            AddressingScheme::Quadkey => write!(f, "quadkey"),
        }
    }
}

/// Selection key for a row of the `tiles` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKey {
    Tms { zoom: i64, column: i64, row: i64 },
    Quadkey(String),
}
