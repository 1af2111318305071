//! Integration tests for the `Dragonfly` snapshot backend.
//!
//! These tests require a live Dragonfly (or Redis) instance. Run with:
//!
//! ```bash
//! docker run -d -p 6379:6379 docker.dragonflydb.io/dragonflydb/dragonfly
//! cargo test -p quakewatch-db -- --ignored
//! ```
//!
//! All tests are marked `#[ignore]` so they are skipped during normal
//! `cargo test` runs.

// Integration tests use expect/unwrap extensively for clarity -- panicking
// on failure is the correct behavior in test code.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]

use chrono::DateTime;
use quakewatch_db::{DragonflyPool, SnapshotStore, TimestampKey};
use quakewatch_types::{Quality, QuakeRecord};

/// Dragonfly connection URL for the local Docker instance.
const DRAGONFLY_URL: &str = "redis://localhost:6379";

async fn connect(prefix: &str) -> SnapshotStore {
    let pool = DragonflyPool::connect(DRAGONFLY_URL, prefix)
        .await
        .expect("Failed to connect to Dragonfly -- is Docker running?");
    SnapshotStore::Dragonfly(pool)
}

#[tokio::test]
#[ignore = "requires live Dragonfly instance"]
async fn dragonfly_snapshot_roundtrip() {
    let store = connect("quakewatch-test-snapshot").await;
    store.clear_snapshot().await.expect("Failed to clear");

    let records = vec![
        QuakeRecord::new("2024p100001")
            .with_location(-38.1, 176.2)
            .with_magnitude(3.9)
            .with_quality(Quality::Automatic),
        QuakeRecord::new("2024p100002").with_magnitude(5.2),
    ];
    store.save_snapshot(&records).await.expect("Failed to save");

    let loaded = store.load_snapshot().await.expect("Failed to load");
    assert_eq!(loaded, records);

    store.clear_snapshot().await.expect("Failed to clear");
    assert!(store.load_snapshot().await.expect("Failed to load").is_empty());
}

#[tokio::test]
#[ignore = "requires live Dragonfly instance"]
async fn dragonfly_timestamp_roundtrip() {
    let store = connect("quakewatch-test-timestamps").await;
    let when = DateTime::from_timestamp_millis(1_709_287_200_000).unwrap();

    store
        .put_timestamp(TimestampKey::LastQuery, when)
        .await
        .expect("Failed to put timestamp");
    let read = store
        .get_timestamp(TimestampKey::LastQuery)
        .await
        .expect("Failed to get timestamp");
    assert_eq!(read, Some(when));
}
