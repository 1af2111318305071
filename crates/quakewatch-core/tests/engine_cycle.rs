//! End-to-end refresh cycle scenarios.
//!
//! Every test drives a [`QuakeEngine`] with a scripted [`StubFeed`], an
//! in-memory snapshot store and an injected clock, then inspects the
//! cycle report, the cache, and what a connected session received.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::float_cmp
)]

use chrono::{DateTime, Duration, Utc};
use quakewatch_core::{FeedSource, FrameReceiver, QuakeEngine, ServiceConfig, StubFeed};
use quakewatch_db::{MemoryStore, SnapshotStore, TimestampKey};
use quakewatch_types::{Quality, QuakeId, QuakeRecord, SyncReport};
use serde_json::Value;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-10T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

struct Harness {
    engine: QuakeEngine,
    feed: StubFeed,
    memory: MemoryStore,
}

impl Harness {
    async fn new() -> Self {
        Self::with_memory(MemoryStore::new()).await
    }

    async fn with_memory(memory: MemoryStore) -> Self {
        let feed = StubFeed::new();
        let engine = QuakeEngine::new(
            ServiceConfig::default(),
            FeedSource::Stub(feed.clone()),
            SnapshotStore::Memory(memory.clone()),
        );
        engine.start().await;
        Self {
            engine,
            feed,
            memory,
        }
    }

    fn store(&self) -> SnapshotStore {
        SnapshotStore::Memory(self.memory.clone())
    }
}

fn quake(id: &str, at: DateTime<Utc>) -> QuakeRecord {
    QuakeRecord::new(id)
        .with_location(-41.3, 174.8)
        .with_magnitude(4.0)
        .with_depth(10.0)
        .with_time(at)
}

/// Payloads of every received frame with the given event name.
fn received(rx: &mut FrameReceiver, event: &str) -> Vec<Value> {
    let mut payloads = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        let value: Value = serde_json::from_str(&frame).unwrap();
        if value[0] == event {
            payloads.push(value[1].clone());
        }
    }
    payloads
}

async fn assert_report_consistent(engine: &QuakeEngine, report: &SyncReport) {
    for id in &report.old_quake_ids {
        assert!(engine.quake(id).await.is_none(), "{id} still cached");
    }
    for record in &report.updated_quakes {
        let cached = engine.quake(record.id()).await.expect("updated record cached");
        assert!(cached.matches(record));
        assert!(!report.old_quake_ids.contains(record.id()));
    }
}

#[tokio::test]
async fn new_record_is_announced_then_polled_until_best() {
    let h = Harness::new().await;
    let (_session, mut rx) = h.engine.connect("10.1.1.1");
    let r1 = quake("2024p000001", t0() - Duration::minutes(30)).with_quality(Quality::Automatic);
    let id = r1.id().clone();

    h.feed.push_search(vec![r1.clone()]);
    let report = h.engine.run_cycle(t0()).await;
    assert_report_consistent(&h.engine, &report).await;

    assert_eq!(report.updated_quakes, vec![r1.clone()]);
    assert_eq!(h.engine.all_quakes().await, vec![r1.clone()]);
    assert!(h.engine.is_polling(&id).await);
    let announced = received(&mut rx, "new_quakes");
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0][0]["id"], "2024p000001");

    // Reviewed upstream with unchanged coordinates: the quality change
    // alone is news.
    h.feed
        .set_fetch(&id, Some(r1.clone().with_quality(Quality::Best)));
    let t1 = t0() + Duration::minutes(1);
    let report = h.engine.run_cycle(t1).await;
    assert_report_consistent(&h.engine, &report).await;

    assert_eq!(report.updated_quakes.len(), 1);
    assert_eq!(report.updated_quakes[0].quality(), Some(Quality::Best));
    assert!(!h.engine.is_polling(&id).await);
    assert_eq!(received(&mut rx, "new_quakes").len(), 1);

    // Reviewed records are never fetched individually again.
    let fetches_so_far = h.feed.fetched().len();
    let report = h.engine.run_cycle(t1 + Duration::minutes(1)).await;
    assert!(report.updated_quakes.is_empty());
    assert_eq!(h.feed.fetched().len(), fetches_so_far);
    assert!(received(&mut rx, "new_quakes").is_empty());
}

#[tokio::test]
async fn unchanged_results_produce_no_broadcast() {
    let h = Harness::new().await;
    let (_session, mut rx) = h.engine.connect("c");
    let r = quake("2024p000002", t0() - Duration::hours(5)).with_quality(Quality::Best);

    h.feed.push_search(vec![r.clone()]);
    h.engine.run_cycle(t0()).await;
    received(&mut rx, "new_quakes");

    h.feed.push_search(vec![r]);
    let report = h.engine.run_cycle(t0() + Duration::minutes(1)).await;
    assert!(report.updated_quakes.is_empty());
    assert!(report.old_quake_ids.is_empty());
    assert!(received(&mut rx, "new_quakes").is_empty());
}

#[tokio::test]
async fn aged_record_is_expired_and_announced() {
    let h = Harness::new().await;
    let (_session, mut rx) = h.engine.connect("c");
    let ttl = Duration::days(7);
    let old = quake("2024p000003", t0() - ttl + Duration::minutes(1));
    let fresh = quake("2024p000004", t0() - Duration::hours(3));

    h.feed.push_search(vec![old.clone(), fresh.clone()]);
    let report = h.engine.run_cycle(t0()).await;
    assert_eq!(report.updated_quakes.len(), 2);
    assert!(report.old_quake_ids.is_empty());

    // No upstream change; the clock alone moves the record past the TTL.
    let report = h.engine.run_cycle(t0() + Duration::minutes(2)).await;
    assert_report_consistent(&h.engine, &report).await;
    assert_eq!(report.old_quake_ids, vec![old.id().clone()]);
    assert_eq!(received(&mut rx, "old_quakes"), vec![serde_json::json!(["2024p000003"])]);
    assert_eq!(h.engine.all_quakes().await, vec![fresh]);
    assert_eq!(h.engine.stats().quakes, 1);
}

#[tokio::test]
async fn deleted_upstream_removes_record_even_when_bulk_fails() {
    let h = Harness::new().await;
    let (_session, mut rx) = h.engine.connect("c");
    let r = quake("2024p000005", t0() - Duration::minutes(40)).with_quality(Quality::Preliminary);
    let id = r.id().clone();

    h.feed.push_search(vec![r.clone()]);
    h.engine.run_cycle(t0()).await;
    assert!(h.engine.is_polling(&id).await);

    h.feed.push_search_failure("connection reset");
    h.feed
        .set_fetch(&id, Some(r.with_quality(Quality::Deleted)));
    let report = h.engine.run_cycle(t0() + Duration::minutes(1)).await;
    assert_report_consistent(&h.engine, &report).await;

    assert_eq!(report.old_quake_ids, vec![id.clone()]);
    assert!(report.updated_quakes.is_empty());
    assert!(h.engine.quake(&id).await.is_none());
    assert!(!h.engine.is_polling(&id).await);
    assert_eq!(received(&mut rx, "old_quakes").len(), 1);
}

#[tokio::test]
async fn records_inside_lookback_are_not_fetched() {
    let h = Harness::new().await;
    let r = quake("2024p000006", t0() - Duration::minutes(3)).with_quality(Quality::Automatic);
    let id = r.id().clone();

    h.feed.push_search(vec![r]);
    h.engine.run_cycle(t0()).await;

    assert!(h.engine.is_polling(&id).await);
    assert!(h.feed.fetched().is_empty());
}

#[tokio::test]
async fn failed_fetch_leaves_record_queued() {
    let h = Harness::new().await;
    let r = quake("2024p000007", t0() - Duration::minutes(30)).with_quality(Quality::Automatic);
    let id = r.id().clone();
    h.feed.push_search(vec![r.clone()]);
    h.feed.set_fetch_failure(&id, "timeout");

    let report = h.engine.run_cycle(t0()).await;
    assert_eq!(report.updated_quakes, vec![r.clone()]);
    assert!(h.engine.is_polling(&id).await);
    assert_eq!(h.engine.quake(&id).await, Some(r));
}

#[tokio::test]
async fn failed_full_query_is_retried_as_full() {
    let h = Harness::new().await;
    h.feed.push_search_failure("503");
    let report = h.engine.run_cycle(t0()).await;
    assert_eq!(report, SyncReport::default());

    let t1 = t0() + Duration::minutes(1);
    h.engine.run_cycle(t1).await;
    let searches = h.feed.searches();
    assert_eq!(searches.len(), 2);
    assert_eq!(searches[0].from, t0() - Duration::days(7));
    assert_eq!(searches[1].from, t1 - Duration::days(7));
    assert_eq!(searches[1].min_magnitude, 3.0);
}

#[tokio::test]
async fn incremental_query_follows_last_success() {
    let h = Harness::new().await;
    h.engine.run_cycle(t0()).await;
    let t1 = t0() + Duration::minutes(1);
    h.feed.push_search_failure("timeout");
    h.engine.run_cycle(t1).await;
    h.engine.run_cycle(t1 + Duration::minutes(1)).await;

    let searches = h.feed.searches();
    // both incremental queries start from the last successful query
    assert_eq!(searches[1].from, t0() - Duration::minutes(10));
    assert_eq!(searches[2].from, t0() - Duration::minutes(10));
}

#[tokio::test]
async fn bulk_and_per_record_updates_are_reported_once() {
    let h = Harness::new().await;
    let r = quake("2024p000008", t0() - Duration::minutes(30)).with_quality(Quality::Automatic);
    let id = r.id().clone();
    h.feed.set_fetch(
        &id,
        Some(r.clone().with_magnitude(4.3).with_quality(Quality::Preliminary)),
    );
    h.feed.push_search(vec![r]);

    let report = h.engine.run_cycle(t0()).await;
    assert_report_consistent(&h.engine, &report).await;
    assert_eq!(report.updated_quakes.len(), 1);
    assert_eq!(report.updated_quakes[0].magnitude(), Some(4.3));
    assert_eq!(report.updated_quakes[0].quality(), Some(Quality::Preliminary));
}

#[tokio::test]
async fn state_survives_restart() {
    let memory = MemoryStore::new();
    let r = quake("2024p000009", t0() - Duration::hours(2));
    {
        let h = Harness::with_memory(memory.clone()).await;
        h.feed.push_search(vec![r.clone()]);
        h.engine.run_cycle(t0()).await;

        let store = h.store();
        assert_eq!(store.load_snapshot().await.unwrap(), vec![r.clone()]);
        assert_eq!(
            store.get_timestamp(TimestampKey::LastFullRefresh).await.unwrap(),
            Some(t0())
        );
    }

    let h = Harness::with_memory(memory).await;
    assert_eq!(h.engine.all_quakes().await, vec![r]);
    assert_eq!(h.engine.stats().quakes, 1);

    // inside the full-refresh interval the restarted engine goes incremental
    h.engine.run_cycle(t0() + Duration::minutes(5)).await;
    assert_eq!(h.feed.searches()[0].from, t0() - Duration::minutes(10));
}

#[tokio::test]
async fn reset_clears_cache_and_snapshot() {
    let h = Harness::new().await;
    let r = quake("2024p000010", t0() - Duration::minutes(30)).with_quality(Quality::Automatic);
    let id = QuakeId::from("2024p000010");
    h.feed.push_search(vec![r]);
    h.engine.run_cycle(t0()).await;
    assert!(h.engine.is_polling(&id).await);

    h.engine.reset().await;
    assert!(h.engine.all_quakes().await.is_empty());
    assert!(!h.engine.is_polling(&id).await);
    assert_eq!(h.engine.stats().quakes, 0);
    assert!(h.store().load_snapshot().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_cycles_run_one_at_a_time() {
    let h = Harness::new().await;
    h.feed.set_search_delay(std::time::Duration::from_millis(50));
    h.feed
        .push_search(vec![quake("2024p000020", t0() - Duration::hours(3))]);
    h.feed
        .push_search(vec![quake("2024p000021", t0() - Duration::minutes(2))]);

    let (first, second) = tokio::join!(h.engine.run_cycle(t0()), h.engine.run_cycle(t0()));

    assert_eq!(h.feed.peak_concurrent_searches(), 1);
    let searches = h.feed.searches();
    assert_eq!(searches.len(), 2);
    // the second plan was made after the first cycle advanced the timestamps
    assert_eq!(searches[0].from, t0() - Duration::days(7));
    assert_eq!(searches[1].from, t0() - Duration::minutes(10));
    assert_eq!(first.updated_quakes.len(), 1);
    assert_eq!(second.updated_quakes.len(), 1);
    assert_eq!(h.engine.all_quakes().await.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_waits_for_running_cycle() {
    let h = Harness::new().await;
    h.feed.set_search_delay(std::time::Duration::from_millis(50));
    h.feed
        .push_search(vec![quake("2024p000030", t0() - Duration::hours(3))]);

    let (report, ()) = tokio::join!(h.engine.run_cycle(t0()), h.engine.reset());

    // the cycle merged its record before reset ran, so nothing survives
    assert_eq!(report.updated_quakes.len(), 1);
    assert!(h.engine.all_quakes().await.is_empty());
    assert_eq!(h.engine.stats().quakes, 0);
    assert!(h.store().load_snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn idle_sessions_are_probed_during_cycle() {
    let h = Harness::new().await;
    let (session, mut rx) = h.engine.connect("c");
    while rx.try_recv().is_ok() {}

    let later = session.last_activity() + Duration::minutes(11);
    h.engine.run_cycle(later).await;
    let pings = received(&mut rx, "ping");
    assert_eq!(pings, vec![serde_json::json!(later.timestamp_millis())]);
    assert!(session.is_open());
}
