//! TileJSON 3.0.0 documents synthesized from MBTiles metadata.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub const TILEJSON_VERSION: &str = "3.0.0";

const DEFAULT_MINZOOM: u8 = 0;
const DEFAULT_MAXZOOM: u8 = 14;

/// Web Mercator world extent.
const DEFAULT_BOUNDS: [f64; 4] = [-180.0, -85.0511, 180.0, 85.0511];
const DEFAULT_CENTER: [f64; 3] = [0.0, 0.0, 2.0];

/// A TileJSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileJson {
    pub tilejson: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,

    pub tiles: Vec<String>,
    pub minzoom: u8,
    pub maxzoom: u8,
    pub bounds: [f64; 4],
    pub center: [f64; 3],

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector_layers: Vec<VectorLayer>,
}

/// One entry of `vector_layers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorLayer {
    pub id: String,

    #[serde(default)]
    pub fields: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minzoom: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxzoom: Option<u8>,
}

/// The `json` metadata entry vector tilesets carry.
#[derive(Deserialize)]
struct MetadataJson {
    #[serde(default)]
    vector_layers: Vec<VectorLayer>,
}

impl TileJson {
    /// Build a TileJSON document for a tileset.
    ///
    /// # Arguments
    /// * `tile_url` - Tile URL template for this tileset, with `{z}/{x}/{y}`
    /// * `metadata` - Contents of the tileset's `metadata` table
    ///
    /// Unparseable zoom levels, bounds and centers fall back to defaults;
    /// a missing or malformed layer description yields no layers.
    pub fn from_mbtiles(tile_url: impl Into<String>, metadata: &HashMap<String, String>) -> Self {
        let text = |key: &str| metadata.get(key).filter(|v| !v.is_empty()).cloned();

        Self {
            tilejson: TILEJSON_VERSION.to_string(),
            name: text("name"),
            description: text("description"),
            version: text("version"),
            attribution: text("attribution"),
            tiles: vec![tile_url.into()],
            minzoom: parse_zoom(metadata.get("minzoom")).unwrap_or(DEFAULT_MINZOOM),
            maxzoom: parse_zoom(metadata.get("maxzoom")).unwrap_or(DEFAULT_MAXZOOM),
            bounds: parse_floats(metadata.get("bounds")).unwrap_or(DEFAULT_BOUNDS),
            center: parse_floats(metadata.get("center")).unwrap_or(DEFAULT_CENTER),
            vector_layers: parse_vector_layers(metadata),
        }
    }
}

fn parse_zoom(value: Option<&String>) -> Option<u8> {
    value?.trim().parse().ok()
}

/// Parse exactly `N` comma-separated finite numbers.
fn parse_floats<const N: usize>(value: Option<&String>) -> Option<[f64; N]> {
    let mut out = [0.0; N];
    let mut parts = value?.split(',');

    for slot in out.iter_mut() {
        let number: f64 = parts.next()?.trim().parse().ok()?;
        if !number.is_finite() {
            return None;
        }
        *slot = number;
    }

    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

fn parse_vector_layers(metadata: &HashMap<String, String>) -> Vec<VectorLayer> {
    if let Some(layers) = metadata
        .get("json")
        .and_then(|json| serde_json::from_str::<MetadataJson>(json).ok())
    {
        if !layers.vector_layers.is_empty() {
            return layers.vector_layers;
        }
    }

    metadata
        .get("vector_layers")
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default()
}
