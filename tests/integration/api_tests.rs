//! API integration tests for tile retrieval, TileJSON and error handling.
//!
//! Tests verify:
//! - Tile bytes, content types and cache headers
//! - Gzip-framed vector tiles advertise their encoding
//! - Error cases (missing tileset, missing tile, malformed coordinates)
//! - TileJSON synthesized from tileset metadata

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use mbtiles_streamer::tile::AddressingScheme;

use super::test_utils::{parks_mbtiles, tms_mbtiles, Harness, TmsRow};

async fn get(router: axum::Router, uri: &str) -> axum::response::Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    router.oneshot(request).await.unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

// =============================================================================
// Tile Retrieval
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_tile_retrieval_success() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    let router = harness.router(AddressingScheme::Tms);

    let response = get(router, "/tile/parks/2/1/1.pbf").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/x-protobuf"
    );
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=600"
    );
    assert!(response.headers().get("content-encoding").is_none());

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"parks-2-1-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gzipped_vector_tile_sets_content_encoding() {
    let harness = Harness::new();
    let gzipped = vec![0x1f, 0x8b, 0x08, 0x00, 0x01, 0x02];
    harness.publish(
        "zipped",
        tms_mbtiles(&[TmsRow::new(0, 0, 0, gzipped.clone())], &[]),
    );
    let router = harness.router(AddressingScheme::Tms);

    let response = get(router, "/tile/zipped/0/0/0.mvt").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.to_vec(), gzipped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_raster_content_types() {
    let harness = Harness::new();
    harness.publish(
        "imagery",
        tms_mbtiles(&[TmsRow::new(0, 0, 0, vec![0x89, b'P', b'N', b'G'])], &[]),
    );
    let router = harness.router(AddressingScheme::Tms);

    for (suffix, expected) in [
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("webp", "image/webp"),
        ("bin", "application/octet-stream"),
    ] {
        let uri = format!("/tile/imagery/0/0/0.{}", suffix);
        let response = get(router.clone(), &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), expected);
    }
}

// =============================================================================
// Error Handling
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_tileset_not_found() {
    let harness = Harness::new();
    let router = harness.router(AddressingScheme::Tms);

    let response = get(router, "/tile/missing/0/0/0.pbf").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["error"], "tileset_not_found");
    assert_eq!(json["status"], 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tile_not_found() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    let router = harness.router(AddressingScheme::Tms);

    let response = get(router, "/tile/parks/10/0/0.pbf").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["error"], "tile_not_found");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_coordinates_rejected() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    let router = harness.router(AddressingScheme::Tms);

    for uri in [
        "/tile/parks/a/1/1.pbf",
        "/tile/parks/2/-1/1.pbf",
        "/tile/parks/2/1/1",
        "/tile/parks/2/1/y.pbf",
    ] {
        let response = get(router.clone(), uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);

        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_request");
    }

    // Malformed requests never touch storage
    assert_eq!(harness.backend.file_size_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_storage_failure_is_server_error() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    harness.backend.set_response_limit(Some(100));
    let router = harness.router(AddressingScheme::Tms);

    let response = get(router, "/tile/parks/2/1/1.pbf").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let json = body_json(response).await;
    assert_eq!(json["error"], "truncated_read");
}

// =============================================================================
// TileJSON
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_tilejson_from_metadata() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    let router = harness.router(AddressingScheme::Tms);

    let response = get(router, "/tile/parks.json").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/json"));

    let json = body_json(response).await;
    assert_eq!(json["tilejson"], "3.0.0");
    assert_eq!(json["name"], "Parks");
    assert_eq!(
        json["tiles"][0],
        "https://maps.example.com/tile/parks/{z}/{x}/{y}.mvt"
    );
    assert_eq!(json["minzoom"], 0);
    assert_eq!(json["maxzoom"], 6);
    assert_eq!(
        json["bounds"],
        serde_json::json!([-123.1, 37.6, -122.3, 37.9])
    );
    assert_eq!(json["center"], serde_json::json!([0.0, 0.0, 2.0]));
    assert_eq!(json["vector_layers"][0]["id"], "parks");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tilejson_missing_tileset() {
    let harness = Harness::new();
    let router = harness.router(AddressingScheme::Tms);

    let response = get(router.clone(), "/tile/missing.json").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Without the .json suffix there is nothing to serve
    let response = get(router, "/tile/parks").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Health Endpoint
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_health_endpoint() {
    let harness = Harness::new();
    let router = harness.router(AddressingScheme::Tms);

    let response = get(router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert!(json["version"].is_string());
}
