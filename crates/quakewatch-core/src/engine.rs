//! The engine: one owned instance that ties cache, scheduler, feed,
//! persistence and subscribers together.
//!
//! # Refresh cycle
//!
//! Each [`QuakeEngine::run_cycle`] call executes, in order:
//!
//! 1. Plan a full or incremental bulk query
//! 2. Query the feed and merge the result into the cache
//! 3. Advance the query timestamps (only on success)
//! 4. Refresh the polling set and fetch polled records concurrently
//! 5. Expire records older than the retention window
//! 6. Persist the cache and both timestamps
//! 7. Broadcast `new_quakes` and `old_quakes` when non-empty
//! 8. Probe idle sessions
//!
//! Cycles never overlap: a second caller waits for the first to finish.
//! Upstream calls run without the state lock held; every cache mutation
//! happens inside it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use quakewatch_db::{SnapshotStore, TimestampKey};
use quakewatch_types::{
    ClientCommand, ClientConfig, Pong, QuakeId, QuakeRecord, ServerEvent, Stats, SyncReport,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::ServiceConfig;
use crate::feed::{FeedError, FeedSource, SearchQuery};
use crate::hub::BroadcastHub;
use crate::scheduler::{self, CycleDiff, FetchOutcome, PollingSet, RefreshSchedule};
use crate::session::{FrameReceiver, Session};

#[derive(Debug, Default)]
struct EngineState {
    cache: CacheStore,
    polling: PollingSet,
    schedule: RefreshSchedule,
}

/// The earthquake feed engine.
#[derive(Debug)]
pub struct QuakeEngine {
    config: ServiceConfig,
    client_config: ClientConfig,
    feed: FeedSource,
    store: SnapshotStore,
    hub: BroadcastHub,
    state: Mutex<EngineState>,
    /// Serializes refresh cycles and resets.
    cycle: Mutex<()>,
}

impl QuakeEngine {
    /// Build an engine around its collaborators. Call [`Self::start`]
    /// before the first cycle.
    pub fn new(config: ServiceConfig, feed: FeedSource, store: SnapshotStore) -> Self {
        let client_config = config.client_config();
        Self {
            config,
            client_config,
            feed,
            store,
            hub: BroadcastHub::new(),
            state: Mutex::new(EngineState::default()),
            cycle: Mutex::new(()),
        }
    }

    /// Restore the persisted cache and scheduler timestamps.
    ///
    /// Persistence failures are logged and leave the corresponding state
    /// empty; the first cycle then runs a full query. Returns the number
    /// of records restored.
    pub async fn start(&self) -> usize {
        let records = self.store.load_snapshot().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to load persisted quakes, starting empty");
            Vec::new()
        });
        let last_query_time = self.load_timestamp(TimestampKey::LastQuery).await;
        let last_full_refresh = self.load_timestamp(TimestampKey::LastFullRefresh).await;

        let mut state = self.state.lock().await;
        state.cache.load(records);
        state.schedule = RefreshSchedule {
            last_query_time,
            last_full_refresh,
        };
        let restored = state.cache.len();
        self.hub.set_quake_count(restored);
        info!(
            quakes = restored,
            feed = self.feed.name(),
            last_query_time = ?last_query_time,
            last_full_refresh = ?last_full_refresh,
            "engine started"
        );
        restored
    }

    async fn load_timestamp(&self, key: TimestampKey) -> Option<DateTime<Utc>> {
        self.store.get_timestamp(key).await.unwrap_or_else(|e| {
            warn!(key = key.key(), error = %e, "failed to load timestamp");
            None
        })
    }

    /// Run one refresh cycle at `now` and return what changed.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> SyncReport {
        let _cycle = self.cycle.lock().await;
        let cache_config = &self.config.cache;
        let mut diff = CycleDiff::new();

        // 1-3. Bulk query and merge.
        let plan = self.state.lock().await.schedule.plan(cache_config, now);
        let query = SearchQuery {
            from: plan.from(),
            min_magnitude: self.config.feed.min_magnitude,
            max_depth_km: self.config.feed.max_depth_km,
        };
        match self.feed.search(&query).await {
            Ok(records) => {
                let returned = records.len();
                let mut state = self.state.lock().await;
                let touched = scheduler::merge_bulk(&mut state.cache, records, &mut diff);
                state.schedule.record_success(plan, now);
                info!(
                    query = plan.label(),
                    from = %plan.from(),
                    returned,
                    touched,
                    "bulk query merged"
                );
            }
            Err(e) => {
                warn!(query = plan.label(), error = %e, "bulk query failed, no data this cycle");
            }
        }

        // 4. Per-record polling.
        let candidates = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state
                .polling
                .refresh(&state.cache, now, cache_config.recent_window());
            let cutoff = state
                .schedule
                .lookback_cutoff(cache_config.search_lookback());
            state.polling.candidates(&state.cache, cutoff)
        };
        if !candidates.is_empty() {
            self.poll_records(candidates, &mut diff).await;
        }

        // 5. Expiry, and the snapshot to persist.
        let (report, snapshot, schedule) = {
            let mut state = self.state.lock().await;
            let expired = state.cache.expire(cache_config.ttl(), now);
            if !expired.is_empty() {
                info!(count = expired.len(), ids = ?expired, "quakes expired");
            }
            for id in &expired {
                state.polling.remove(id);
            }
            diff.extend_removed(&expired);
            self.hub.set_quake_count(state.cache.len());
            (
                diff.into_report(&state.cache),
                state.cache.all(),
                state.schedule,
            )
        };

        // 6. Persist.
        self.persist(&snapshot, schedule).await;

        // 7. Broadcast.
        if !report.updated_quakes.is_empty() {
            self.hub
                .broadcast(&ServerEvent::NewQuakes(report.updated_quakes.clone()), now);
        }
        if !report.old_quake_ids.is_empty() {
            self.hub
                .broadcast(&ServerEvent::OldQuakes(report.old_quake_ids.clone()), now);
        }

        // 8. Liveness.
        self.hub
            .liveness_sweep(now, self.config.sessions.idle_threshold());

        info!(
            quakes = snapshot.len(),
            updated = report.updated_quakes.len(),
            removed = report.old_quake_ids.len(),
            "refresh cycle complete"
        );
        report
    }

    /// Fetch polled records concurrently and apply each answer as it
    /// arrives.
    async fn poll_records(&self, candidates: Vec<QuakeRecord>, diff: &mut CycleDiff) {
        let feed = &self.feed;
        let limit = self.config.refresh.max_concurrent_fetches.max(1);
        let count = candidates.len();
        let mut answers = futures::stream::iter(candidates)
            .map(|hint| async move {
                let id = hint.id().clone();
                let result: Result<Option<QuakeRecord>, FeedError> =
                    feed.fetch_one(&id, Some(&hint)).await;
                (id, result)
            })
            .buffer_unordered(limit);

        let mut updated = 0_usize;
        let mut removed = 0_usize;
        while let Some((id, result)) = answers.next().await {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match scheduler::apply_fetch(&mut state.cache, &mut state.polling, &id, result, diff) {
                FetchOutcome::Updated => updated = updated.saturating_add(1),
                FetchOutcome::Removed => {
                    info!(quake_id = %id, "quake deleted upstream");
                    removed = removed.saturating_add(1);
                }
                FetchOutcome::Unchanged => {}
            }
        }
        debug!(polled = count, updated, removed, "single-record refresh done");
    }

    async fn persist(&self, snapshot: &[QuakeRecord], schedule: RefreshSchedule) {
        if let Err(e) = self.store.save_snapshot(snapshot).await {
            warn!(error = %e, "failed to persist quakes");
        }
        let timestamps = [
            (TimestampKey::LastQuery, schedule.last_query_time),
            (TimestampKey::LastFullRefresh, schedule.last_full_refresh),
        ];
        for (key, value) in timestamps {
            let Some(value) = value else { continue };
            if let Err(e) = self.store.put_timestamp(key, value).await {
                warn!(key = key.key(), error = %e, "failed to persist timestamp");
            }
        }
    }

    /// Open a session for `client`.
    pub fn connect(&self, client: &str) -> (Arc<Session>, FrameReceiver) {
        self.hub.register(client, Utc::now())
    }

    /// Close a session. Safe to call more than once.
    pub fn disconnect(&self, session: &Session) {
        self.hub.unregister(session, Utc::now());
    }

    /// Handle one inbound text frame from `session`.
    ///
    /// `sync` is answered with `config` then `all_quakes`; `ping` with
    /// `pong`. Anything else, including frames that do not decode, is
    /// ignored.
    pub async fn handle_inbound(&self, session: &Session, text: &str, now: DateTime<Utc>) {
        if !session.is_open() {
            return;
        }
        session.touch(now);
        let command = match ClientCommand::parse(text) {
            Ok(command) => command,
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "ignoring undecodable frame");
                return;
            }
        };
        match command {
            ClientCommand::Sync => {
                if self
                    .hub
                    .send(session, &ServerEvent::Config(self.client_config), now)
                {
                    let quakes = self.all_quakes().await;
                    self.hub.send(session, &ServerEvent::AllQuakes(quakes), now);
                }
            }
            ClientCommand::Ping(then) => {
                let now_ms = now.timestamp_millis();
                let pong = Pong {
                    then,
                    now: now_ms,
                    diff: now_ms.saturating_sub(then),
                };
                self.hub.send(session, &ServerEvent::Pong(pong), now);
            }
            ClientCommand::Other(name) => {
                debug!(session_id = %session.id(), command = %name, "ignoring command");
            }
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> Stats {
        self.hub.stats()
    }

    /// Every cached record in observation order.
    pub async fn all_quakes(&self) -> Vec<QuakeRecord> {
        self.state.lock().await.cache.all()
    }

    /// Look up one cached record.
    pub async fn quake(&self, id: &QuakeId) -> Option<QuakeRecord> {
        self.state.lock().await.cache.get(id).cloned()
    }

    /// Whether `id` is being polled individually.
    pub async fn is_polling(&self, id: &QuakeId) -> bool {
        self.state.lock().await.polling.contains(id)
    }

    /// Query settings reported to clients.
    pub const fn client_config(&self) -> ClientConfig {
        self.client_config
    }

    /// Drop every cached record and all polling state, and clear the
    /// persisted snapshot. Scheduler timestamps are kept.
    pub async fn reset(&self) {
        let _cycle = self.cycle.lock().await;
        {
            let mut state = self.state.lock().await;
            state.cache.clear();
            state.polling.clear();
            self.hub.set_quake_count(0);
        }
        if let Err(e) = self.store.clear_snapshot().await {
            warn!(error = %e, "failed to clear persisted quakes");
        }
        info!("cache cleared");
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::feed::StubFeed;
    use quakewatch_db::MemoryStore;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_709_287_200_000).unwrap()
    }

    fn engine() -> QuakeEngine {
        QuakeEngine::new(
            ServiceConfig::default(),
            FeedSource::Stub(StubFeed::new()),
            SnapshotStore::Memory(MemoryStore::new()),
        )
    }

    fn drain(rx: &mut FrameReceiver) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn ping_is_answered_with_timing() {
        let engine = engine();
        let (session, mut rx) = engine.connect("c");
        drain(&mut rx);

        let then = now().timestamp_millis() - 250;
        engine
            .handle_inbound(&session, &format!(r#"["ping",{then}]"#), now())
            .await;
        let frames = drain(&mut rx);
        assert_eq!(
            frames,
            vec![format!(
                r#"["pong",{{"then":{then},"now":{},"diff":250}}]"#,
                now().timestamp_millis()
            )]
        );
    }

    #[tokio::test]
    async fn sync_sends_config_then_listing() {
        let engine = engine();
        let (session, mut rx) = engine.connect("c");
        drain(&mut rx);

        engine.handle_inbound(&session, r#"["sync",null]"#, now()).await;
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with(r#"["config","#));
        assert_eq!(frames[1], r#"["all_quakes",[]]"#);
    }

    #[tokio::test]
    async fn unknown_and_garbage_frames_are_ignored() {
        let engine = engine();
        let (session, mut rx) = engine.connect("c");
        drain(&mut rx);

        engine.handle_inbound(&session, r#"["pong",1]"#, now()).await;
        engine.handle_inbound(&session, "not json", now()).await;
        engine.handle_inbound(&session, r#"["ping","soon"]"#, now()).await;
        assert!(drain(&mut rx).is_empty());
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn disconnect_twice_is_harmless() {
        let engine = engine();
        let (session, _rx) = engine.connect("c");
        assert_eq!(engine.stats().connected_clients, 1);
        engine.disconnect(&session);
        engine.disconnect(&session);
        let stats = engine.stats();
        assert_eq!(stats.connected_clients, 0);
        assert_eq!(stats.connected_clients_peak, 1);
    }
}
