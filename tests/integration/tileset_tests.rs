//! Tileset connection cache integration tests.
//!
//! Tests verify:
//! - Concurrent first requests share one existence check and one open
//! - Least recently used connections are released on eviction
//! - Invalidation closes the handle and forces a reopen
//! - Eviction closes every pooled connection
//! - Invalid names never reach storage

use std::sync::Arc;
use std::time::Duration;

use mbtiles_streamer::TileError;

use super::test_utils::{parks_mbtiles, Harness, TEST_CHUNK_SIZE};

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_opens_share_one_open() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());
    harness
        .backend
        .set_latency(Some(Duration::from_millis(50)));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let tilesets = harness.tilesets.clone();
        handles.push(tokio::spawn(
            async move { tilesets.get_or_open("parks").await },
        ));
    }

    let mut connections = Vec::new();
    for handle in handles {
        connections.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(harness.backend.file_size_calls(), 1);
    assert_eq!(harness.tilesets.open_count(), 1);
    for conn in &connections[1..] {
        assert!(Arc::ptr_eq(conn, &connections[0]));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_opens_of_missing_tileset_share_the_error() {
    let harness = Harness::new();
    harness
        .backend
        .set_latency(Some(Duration::from_millis(50)));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let tilesets = harness.tilesets.clone();
        handles.push(tokio::spawn(
            async move { tilesets.get_or_open("missing").await },
        ));
    }

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, TileError::TilesetNotFound { .. }));
    }
    assert_eq!(harness.backend.file_size_calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cached_connection_is_reused() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());

    let first = harness.tilesets.get_or_open("parks").await.unwrap();
    let second = harness.tilesets.get_or_open("parks").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(harness.backend.file_size_calls(), 1);
    assert_eq!(harness.tilesets.cached_count().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_eviction_releases_least_recently_used() {
    let harness = Harness::with_options(TEST_CHUNK_SIZE, 64, 2);
    for name in ["a", "b", "c"] {
        harness.publish(name, parks_mbtiles());
    }

    let a = harness.tilesets.get_or_open("a").await.unwrap();
    let b = harness.tilesets.get_or_open("b").await.unwrap();

    // Touch "a" so "b" becomes least recently used
    harness.tilesets.get_or_open("a").await.unwrap();
    let c = harness.tilesets.get_or_open("c").await.unwrap();

    assert_eq!(harness.tilesets.cached_count().await, 2);
    assert!(!a.is_released());
    assert!(b.is_released());
    assert!(!c.is_released());

    // A released handle refuses queries
    let err = b.query_metadata().unwrap_err();
    assert!(matches!(err, TileError::ConnectionReleased(_)));

    // Reopening "b" gives a fresh handle
    let reopened = harness.tilesets.get_or_open("b").await.unwrap();
    assert!(!Arc::ptr_eq(&reopened, &b));
    assert_eq!(harness.tilesets.open_count(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_eviction_closes_pool_and_forgets_size() {
    let harness = Harness::with_options(TEST_CHUNK_SIZE, 64, 1);
    harness.publish("a", parks_mbtiles());
    harness.publish("b", parks_mbtiles());

    let a = harness.tilesets.get_or_open("a").await.unwrap();
    let query = a.clone();
    tokio::task::spawn_blocking(move || query.query_metadata())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.open_connections(), 1);
    assert_eq!(harness.tilesets.vfs().remembered_sizes(), 1);

    harness.tilesets.get_or_open("b").await.unwrap();

    assert!(a.is_released());
    assert_eq!(a.open_connections(), 0);
    // Only the size of the tileset still cached is remembered
    assert_eq!(harness.tilesets.vfs().remembered_sizes(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalidate_forces_reopen() {
    let harness = Harness::new();
    harness.publish("parks", parks_mbtiles());

    let first = harness.tilesets.get_or_open("parks").await.unwrap();
    harness.tilesets.invalidate("parks").await;

    assert!(first.is_released());
    assert_eq!(harness.tilesets.cached_count().await, 0);

    let second = harness.tilesets.get_or_open("parks").await.unwrap();
    assert!(!second.is_released());
    assert_eq!(harness.tilesets.open_count(), 2);
    assert_eq!(harness.backend.file_size_calls(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clear_releases_everything() {
    let harness = Harness::new();
    harness.publish("a", parks_mbtiles());
    harness.publish("b", parks_mbtiles());

    let a = harness.tilesets.get_or_open("a").await.unwrap();
    let b = harness.tilesets.get_or_open("b").await.unwrap();
    harness.tilesets.clear().await;

    assert!(a.is_released());
    assert!(b.is_released());
    assert_eq!(harness.tilesets.cached_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_tileset_is_not_remembered() {
    let harness = Harness::new();

    let err = harness.tilesets.get_or_open("late").await.unwrap_err();
    assert!(err.is_not_found());

    harness.publish("late", parks_mbtiles());
    let conn = harness.tilesets.get_or_open("late").await.unwrap();
    assert_eq!(conn.name(), "late");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_names_never_reach_storage() {
    let harness = Harness::new();

    for name in ["", "..", "../etc/passwd", "a/b", "a\\b"] {
        let err = harness.tilesets.get_or_open(name).await.unwrap_err();
        assert!(matches!(err, TileError::TilesetNotFound { .. }));
    }

    assert_eq!(harness.backend.file_size_calls(), 0);
}
