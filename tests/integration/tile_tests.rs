//! Tile service integration tests.
//!
//! Tests verify:
//! - XYZ requests are flipped to TMS rows before lookup
//! - Quadkey-keyed tilesets resolve the same coordinates
//! - Missing tilesets and tiles map to the right errors
//! - Truncated backend responses fail the request and are never cached
//! - Page reads are chunk aligned and served from cache when repeated
//! - Queries on one tileset use separate pooled connections

use std::sync::{mpsc, Arc};
use std::time::Duration;

use mbtiles_streamer::tile::{quadkey, AddressingScheme, TileCoordinate};
use mbtiles_streamer::tileset::{PoolOptions, TilesetConnection};
use mbtiles_streamer::{StorageError, TileError};
use tokio::task::JoinHandle;

use super::test_utils::{
    large_mbtiles, parks_mbtiles, quadkey_mbtiles, tile_payload, Harness, TEST_CHUNK_SIZE,
};

// =============================================================================
// Basic Tile Retrieval
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_xyz_request_reads_tms_row() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    let service = harness.service(AddressingScheme::Tms);

    // XYZ row 1 at zoom 2 is stored as TMS row 2
    let tile = service.resolve_tile("parks", 2, 1, 1).await.unwrap();
    assert_eq!(&tile[..], b"parks-2-1-1");

    // The unflipped row does not exist
    let err = service.resolve_tile("parks", 2, 1, 2).await.unwrap_err();
    assert!(matches!(err, TileError::TileNotFound { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_tileset() {
    let harness = Harness::new();
    let service = harness.service(AddressingScheme::Tms);

    let err = service.resolve_tile("missing", 0, 0, 0).await.unwrap_err();
    assert!(matches!(err, TileError::TilesetNotFound { ref tileset } if tileset == "missing"));

    // The pre-open check is the only storage call made
    assert_eq!(harness.backend.file_size_calls(), 1);
    assert_eq!(harness.backend.range_calls(), 0);
    assert_eq!(harness.tilesets.open_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_tile() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    let service = harness.service(AddressingScheme::Tms);

    let err = service.resolve_tile("parks", 10, 0, 0).await.unwrap_err();
    match err {
        TileError::TileNotFound { tileset, z, x, y } => {
            assert_eq!(tileset, "parks");
            assert_eq!((z, x, y), (10, 0, 0));
        }
        other => panic!("expected TileNotFound, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_range_zoom_is_tile_not_found() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    let service = harness.service(AddressingScheme::Tms);

    let err = service.resolve_tile("parks", 200, 0, 0).await.unwrap_err();
    assert!(matches!(err, TileError::TileNotFound { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quadkey_addressing() {
    let harness = Harness::new();
    let key = quadkey(TileCoordinate::new(3, 3, 5));
    assert_eq!(key, "213");

    harness.publish(
        "roads",
        quadkey_mbtiles(&[(key.as_str(), b"roads-213".to_vec())], &[("name", "Roads")]),
    );
    let service = harness.service(AddressingScheme::Quadkey);

    let tile = service.resolve_tile("roads", 3, 3, 5).await.unwrap();
    assert_eq!(&tile[..], b"roads-213");

    let err = service.resolve_tile("roads", 3, 5, 3).await.unwrap_err();
    assert!(matches!(err, TileError::TileNotFound { .. }));

    // The fixture also carries TMS columns decoded from the key
    let tms = harness.service(AddressingScheme::Tms);
    let tile = tms.resolve_tile("roads", 3, 3, 5).await.unwrap();
    assert_eq!(&tile[..], b"roads-213");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resolve_metadata() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    let service = harness.service(AddressingScheme::Tms);

    let metadata = service.resolve_metadata("parks").await.unwrap();
    assert_eq!(metadata.get("name").map(String::as_str), Some("Parks"));
    assert_eq!(metadata.get("maxzoom").map(String::as_str), Some("6"));

    let err = service.resolve_metadata("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

// =============================================================================
// Storage Failures
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_truncated_read_fails_and_is_not_cached() {
    let harness = Harness::with_options(TEST_CHUNK_SIZE, 64, 4);
    harness.publish("parks", parks_mbtiles());
    harness.backend.set_response_limit(Some(3000));
    let service = harness.service(AddressingScheme::Tms);

    let err = service.resolve_tile("parks", 2, 1, 1).await.unwrap_err();
    assert!(
        matches!(
            err,
            TileError::Storage(StorageError::TruncatedRead {
                expected: 4096,
                actual: 3000,
                ..
            })
        ),
        "unexpected error: {:?}",
        err
    );
    assert_eq!(harness.chunk_cache_len().await, 0);
    assert_eq!(harness.tilesets.cached_count().await, 0);

    // Once the backend recovers the same request succeeds
    harness.backend.set_response_limit(None);
    let tile = service.resolve_tile("parks", 2, 1, 1).await.unwrap();
    assert_eq!(&tile[..], b"parks-2-1-1");
}

// =============================================================================
// Chunked Reads
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_every_tile_of_large_tileset() {
    let harness = Harness::with_options(TEST_CHUNK_SIZE * 2, 512, 4);
    harness.publish("large", large_mbtiles());
    let service = harness.service(AddressingScheme::Tms);

    for x in 0..16u32 {
        for y in 0..16u32 {
            let tile = service.resolve_tile("large", 4, x, y).await.unwrap();
            let tms_row = 15 - i64::from(y);
            assert_eq!(tile.to_vec(), tile_payload(i64::from(x), tms_row));
        }
    }

    for (start, end) in harness.backend.requested_ranges() {
        assert_eq!(start % (TEST_CHUNK_SIZE as u64 * 2), 0);
        assert!(end - start < TEST_CHUNK_SIZE as u64 * 2);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repeated_request_makes_no_backend_calls() {
    let harness = Harness::with_options(TEST_CHUNK_SIZE, 512, 4);
    harness.publish("large", large_mbtiles());
    let service = harness.service(AddressingScheme::Tms);

    let first = service.resolve_tile("large", 4, 3, 9).await.unwrap();
    assert!(harness.backend.range_calls() > 0);

    harness.backend.reset_counters();
    let second = service.resolve_tile("large", 4, 3, 9).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.backend.range_calls(), 0);
    assert_eq!(harness.backend.file_size_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tilesets_share_the_chunk_cache() {
    let harness = Harness::with_options(TEST_CHUNK_SIZE, 512, 4);
    harness.publish("parks", parks_mbtiles());
    harness.publish("large", large_mbtiles());
    let service = harness.service(AddressingScheme::Tms);

    service.resolve_tile("parks", 2, 1, 1).await.unwrap();
    let after_parks = harness.chunk_cache_len().await;
    assert!(after_parks > 0);

    service.resolve_tile("large", 4, 0, 0).await.unwrap();
    assert!(harness.chunk_cache_len().await > after_parks);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_for_different_tiles() {
    let harness = Harness::with_options(TEST_CHUNK_SIZE, 512, 4);
    harness.publish("large", large_mbtiles());
    let service = Arc::new(harness.service(AddressingScheme::Tms));

    let mut handles = Vec::new();
    for x in 0..8u32 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let tile = service.resolve_tile("large", 4, x, 0).await.unwrap();
            (x, tile)
        }));
    }

    for handle in handles {
        let (x, tile) = handle.await.unwrap();
        assert_eq!(tile.to_vec(), tile_payload(i64::from(x), 15));
    }

    // All requests shared a single open
    assert_eq!(harness.tilesets.open_count(), 1);
}

// =============================================================================
// Connection Pool
// =============================================================================

/// Check out a connection and hold it until the returned sender fires.
async fn hold_connection(
    conn: Arc<TilesetConnection>,
) -> (JoinHandle<Result<(), TileError>>, mpsc::Sender<()>) {
    let (held_tx, held_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = tokio::task::spawn_blocking(move || {
        conn.run(move |_| {
            let _ = held_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        })
    });
    held_rx.await.unwrap();

    (holder, release_tx)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queries_on_one_tileset_run_side_by_side() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    let service = harness.service(AddressingScheme::Tms);

    let conn = harness.tilesets.get_or_open("parks").await.unwrap();
    let (holder, release) = hold_connection(conn.clone()).await;

    // A second request gets its own connection instead of queueing
    let tile = tokio::time::timeout(
        Duration::from_secs(5),
        service.resolve_tile("parks", 2, 1, 1),
    )
    .await
    .expect("request queued behind the held connection")
    .unwrap();
    assert_eq!(&tile[..], b"parks-2-1-1");
    assert_eq!(conn.open_connections(), 2);

    release.send(()).unwrap();
    holder.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pool_size_bounds_concurrent_queries() {
    let harness = Harness::with_pool(
        TEST_CHUNK_SIZE,
        64,
        4,
        PoolOptions::new(1).with_checkout_timeout(Duration::from_millis(200)),
    );
    harness.publish("parks", parks_mbtiles());
    let service = harness.service(AddressingScheme::Tms);

    let conn = harness.tilesets.get_or_open("parks").await.unwrap();
    let (holder, release) = hold_connection(conn).await;

    let err = service.resolve_tile("parks", 2, 1, 1).await.unwrap_err();
    assert!(
        matches!(err, TileError::Storage(StorageError::Transient(_))),
        "unexpected error: {:?}",
        err
    );

    release.send(()).unwrap();
    holder.await.unwrap().unwrap();

    // With the connection back in the pool the request succeeds
    let tile = service.resolve_tile("parks", 2, 1, 1).await.unwrap();
    assert_eq!(&tile[..], b"parks-2-1-1");
}
