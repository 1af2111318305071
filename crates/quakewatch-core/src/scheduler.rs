//! Refresh policy: which bulk query to run, how results merge into the
//! cache, and which records are chased individually.
//!
//! Everything here is synchronous and operates on borrowed state so the
//! engine can hold its state lock only around the pure steps and release
//! it while upstream calls are outstanding.
//!
//! # Bulk policy
//!
//! A FULL query (covering the whole retention window) runs when no full
//! refresh has ever succeeded or the full-refresh interval has elapsed.
//! Otherwise an INCREMENTAL query starts at the last query time minus the
//! search lookback, which tolerates provider reporting lag. Timestamps
//! advance only after a successful response.
//!
//! # Per-record policy
//!
//! Recent records whose review quality is not terminal sit in the
//! [`PollingSet`] and are fetched one by one, unless the bulk lookback
//! window already covers them. A `deleted` answer removes the record; a
//! `best` answer ends polling.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use quakewatch_types::{Quality, QuakeId, QuakeRecord, SyncReport};

use crate::cache::{CacheStore, Upsert};
use crate::config::CacheConfig;
use crate::feed::FeedError;

/// Which bulk query a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPlan {
    /// Everything inside the retention window.
    Full {
        /// Start of the queried range.
        from: DateTime<Utc>,
    },
    /// Only what may have changed since the last query.
    Incremental {
        /// Start of the queried range.
        from: DateTime<Utc>,
    },
}

impl QueryPlan {
    /// Start of the queried range.
    pub const fn from(&self) -> DateTime<Utc> {
        match self {
            Self::Full { from } | Self::Incremental { from } => *from,
        }
    }

    /// Whether this is a full query.
    pub const fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }

    /// Label for logging.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Full { .. } => "full",
            Self::Incremental { .. } => "incremental",
        }
    }
}

/// The two timestamps that drive the bulk policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSchedule {
    /// Time of the last successful bulk query.
    pub last_query_time: Option<DateTime<Utc>>,
    /// Time of the last successful full query.
    pub last_full_refresh: Option<DateTime<Utc>>,
}

impl RefreshSchedule {
    /// Decide which query to run at `now`.
    pub fn plan(&self, config: &CacheConfig, now: DateTime<Utc>) -> QueryPlan {
        let full_due = self
            .last_full_refresh
            .is_none_or(|last| elapsed(last, now) >= config.full_refresh_interval());

        match (full_due, self.last_query_time) {
            (false, Some(last_query)) => QueryPlan::Incremental {
                from: minus(last_query, config.search_lookback()),
            },
            _ => QueryPlan::Full {
                from: minus(now, config.ttl()),
            },
        }
    }

    /// Advance the timestamps after `plan` succeeded at `now`.
    pub const fn record_success(&mut self, plan: QueryPlan, now: DateTime<Utc>) {
        self.last_query_time = Some(now);
        if plan.is_full() {
            self.last_full_refresh = Some(now);
        }
    }

    /// Records newer than this are covered by the bulk lookback and need
    /// no individual fetch. `None` before the first successful query.
    pub fn lookback_cutoff(&self, lookback: Duration) -> Option<DateTime<Utc>> {
        self.last_query_time.map(|last| minus(last, lookback))
    }
}

fn minus(at: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(span)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
}

/// Identities of recent, unreviewed records awaiting individual fetches.
#[derive(Debug, Clone, Default)]
pub struct PollingSet {
    ids: HashSet<QuakeId>,
}

impl PollingSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-evaluate membership for every cached record.
    ///
    /// Records older than `window` leave the set; recent ones with a
    /// non-terminal quality join it. Recent records that already reached
    /// a terminal quality keep whatever membership they had.
    pub fn refresh(&mut self, cache: &CacheStore, now: DateTime<Utc>, window: Duration) {
        for record in cache.iter() {
            if !record.is_recent(now, window) {
                self.ids.remove(record.id());
            } else if !record.quality().is_some_and(Quality::is_terminal) {
                self.ids.insert(record.id().clone());
            }
        }
    }

    /// Records to fetch this cycle, as hints cloned from the cache.
    ///
    /// Ids that have left the cache are dropped from the set. Records
    /// whose time is after `cutoff` are skipped but stay queued.
    pub fn candidates(
        &mut self,
        cache: &CacheStore,
        cutoff: Option<DateTime<Utc>>,
    ) -> Vec<QuakeRecord> {
        self.ids.retain(|id| cache.contains(id));
        cache
            .iter()
            .filter(|record| self.ids.contains(record.id()))
            .filter(|record| {
                !matches!((record.time(), cutoff), (Some(time), Some(cutoff)) if time > cutoff)
            })
            .cloned()
            .collect()
    }

    /// Stop polling `id`.
    pub fn remove(&mut self, id: &QuakeId) {
        self.ids.remove(id);
    }

    /// Whether `id` is being polled.
    pub fn contains(&self, id: &QuakeId) -> bool {
        self.ids.contains(id)
    }

    /// Drop every id.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Number of polled ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether nothing is being polled.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// The `updated` and `removed` identities produced by one cycle.
///
/// Both lists keep first-seen order and hold each id at most once.
#[derive(Debug, Clone, Default)]
pub struct CycleDiff {
    updated: Vec<QuakeId>,
    updated_seen: HashSet<QuakeId>,
    removed: Vec<QuakeId>,
    removed_seen: HashSet<QuakeId>,
}

impl CycleDiff {
    /// Create an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `id` was inserted or changed.
    pub fn mark_updated(&mut self, id: &QuakeId) {
        if self.updated_seen.insert(id.clone()) {
            self.updated.push(id.clone());
        }
    }

    /// Note that `id` left the cache.
    pub fn mark_removed(&mut self, id: &QuakeId) {
        if self.removed_seen.insert(id.clone()) {
            self.removed.push(id.clone());
        }
    }

    /// Note several removals.
    pub fn extend_removed(&mut self, ids: &[QuakeId]) {
        for id in ids {
            self.mark_removed(id);
        }
    }

    /// Resolve the diff against the post-cycle cache.
    ///
    /// Updated entries carry their final cached state. An id that was
    /// removed later in the cycle is reported only as removed.
    pub fn into_report(self, cache: &CacheStore) -> SyncReport {
        let Self {
            updated,
            removed,
            removed_seen,
            ..
        } = self;
        let updated_quakes = updated
            .iter()
            .filter(|id| !removed_seen.contains(*id))
            .filter_map(|id| cache.get(id).cloned())
            .collect();
        SyncReport {
            updated_quakes,
            old_quake_ids: removed,
        }
    }
}

/// Merge a bulk result into the cache.
///
/// New ids are inserted; known ids that no longer match are updated in
/// place. Returns how many records were inserted or changed.
pub fn merge_bulk(cache: &mut CacheStore, records: Vec<QuakeRecord>, diff: &mut CycleDiff) -> usize {
    let mut touched = 0_usize;
    for record in records {
        let id = record.id().clone();
        let changed = match cache.upsert(record.clone()) {
            Upsert::Inserted => true,
            Upsert::Existing(existing) => !existing.matches(&record) && existing.update(&record),
        };
        if changed {
            diff.mark_updated(&id);
            touched = touched.saturating_add(1);
        }
    }
    touched
}

/// What a single-record fetch did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Failure, no answer, or no news.
    Unchanged,
    /// The cached record was updated.
    Updated,
    /// The provider marked the event deleted; it left the cache.
    Removed,
}

/// Apply the answer of one single-record fetch.
pub fn apply_fetch(
    cache: &mut CacheStore,
    polling: &mut PollingSet,
    id: &QuakeId,
    result: Result<Option<QuakeRecord>, FeedError>,
    diff: &mut CycleDiff,
) -> FetchOutcome {
    let fetched = match result {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::debug!(quake_id = %id, "single-record fetch returned nothing");
            return FetchOutcome::Unchanged;
        }
        Err(e) => {
            tracing::warn!(quake_id = %id, error = %e, "single-record fetch failed");
            return FetchOutcome::Unchanged;
        }
    };

    if fetched.quality() == Some(Quality::Deleted) {
        cache.remove(id);
        polling.remove(id);
        diff.mark_removed(id);
        return FetchOutcome::Removed;
    }

    // Expired while the fetch was in flight.
    let Some(cached) = cache.get_mut(id) else {
        polling.remove(id);
        return FetchOutcome::Unchanged;
    };

    let outcome = if !cached.matches(&fetched) && cached.update(&fetched) {
        diff.mark_updated(id);
        FetchOutcome::Updated
    } else {
        FetchOutcome::Unchanged
    };

    if cached.quality() == Some(Quality::Best) {
        polling.remove(id);
    }
    outcome
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn config() -> CacheConfig {
        CacheConfig::default()
    }

    fn quake(id: &str, minutes_ago: i64) -> QuakeRecord {
        QuakeRecord::new(id)
            .with_time(now() - Duration::minutes(minutes_ago))
            .with_magnitude(3.5)
            .with_quality(Quality::Automatic)
    }

    #[test]
    fn first_cycle_is_full() {
        let plan = RefreshSchedule::default().plan(&config(), now());
        assert_eq!(
            plan,
            QueryPlan::Full {
                from: now() - Duration::days(7)
            }
        );
    }

    #[test]
    fn incremental_until_full_interval_elapses() {
        let mut schedule = RefreshSchedule::default();
        let start = now();
        schedule.record_success(schedule.plan(&config(), start), start);
        assert_eq!(schedule.last_full_refresh, Some(start));

        let later = start + Duration::minutes(1);
        let plan = schedule.plan(&config(), later);
        assert_eq!(
            plan,
            QueryPlan::Incremental {
                from: start - Duration::minutes(10)
            }
        );
        schedule.record_success(plan, later);
        assert_eq!(schedule.last_query_time, Some(later));
        assert_eq!(schedule.last_full_refresh, Some(start));

        let due = start + Duration::minutes(60);
        assert!(schedule.plan(&config(), due).is_full());
    }

    #[test]
    fn full_refresh_without_query_time_stays_full() {
        let schedule = RefreshSchedule {
            last_query_time: None,
            last_full_refresh: Some(now()),
        };
        assert!(schedule.plan(&config(), now()).is_full());
    }

    #[test]
    fn merge_inserts_updates_and_ignores() {
        let mut cache = CacheStore::new();
        let mut diff = CycleDiff::new();
        cache.upsert(quake("same", 30));
        cache.upsert(quake("changed", 30));

        let touched = merge_bulk(
            &mut cache,
            vec![
                quake("same", 30),
                quake("changed", 30).with_magnitude(4.1),
                quake("new", 5),
            ],
            &mut diff,
        );
        assert_eq!(touched, 2);
        let report = diff.into_report(&cache);
        let ids: Vec<&str> = report.updated_quakes.iter().map(|q| q.id().as_str()).collect();
        assert_eq!(ids, ["changed", "new"]);
        assert_eq!(report.updated_quakes[0].magnitude(), Some(4.1));
    }

    #[test]
    fn permalink_change_alone_is_merged() {
        let mut cache = CacheStore::new();
        let mut diff = CycleDiff::new();
        cache.upsert(quake("moved", 30).with_url("https://a.example/moved"));

        let touched = merge_bulk(
            &mut cache,
            vec![quake("moved", 30).with_url("https://b.example/moved")],
            &mut diff,
        );
        assert_eq!(touched, 1);
        let report = diff.into_report(&cache);
        assert_eq!(report.updated_quakes.len(), 1);
        assert_eq!(
            report.updated_quakes[0].url(),
            Some("https://b.example/moved")
        );
    }

    #[test]
    fn diff_reports_each_id_once_in_first_seen_order() {
        let mut cache = CacheStore::new();
        for id in ["a", "b", "c"] {
            cache.upsert(quake(id, 30));
        }
        let mut diff = CycleDiff::new();
        for id in ["b", "a", "b", "c", "a"] {
            diff.mark_updated(&QuakeId::from(id));
        }
        diff.mark_removed(&QuakeId::from("c"));
        diff.extend_removed(&[QuakeId::from("c"), QuakeId::from("z")]);

        let report = diff.into_report(&cache);
        let ids: Vec<&str> = report.updated_quakes.iter().map(|q| q.id().as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(
            report.old_quake_ids,
            vec![QuakeId::from("c"), QuakeId::from("z")]
        );
    }

    #[test]
    fn polling_set_tracks_recent_unreviewed_records() {
        let mut cache = CacheStore::new();
        cache.upsert(quake("recent", 30));
        cache.upsert(quake("reviewed", 30).with_quality(Quality::Best));
        cache.upsert(quake("old", 90));
        let mut polling = PollingSet::new();
        polling.refresh(&cache, now(), Duration::minutes(60));

        assert!(polling.contains(&QuakeId::from("recent")));
        assert!(!polling.contains(&QuakeId::from("reviewed")));
        assert!(!polling.contains(&QuakeId::from("old")));
    }

    #[test]
    fn candidates_skip_lookback_and_forget_vanished_records() {
        let mut cache = CacheStore::new();
        cache.upsert(quake("covered", 5));
        cache.upsert(quake("due", 30));
        cache.upsert(quake("vanishing", 30));
        let mut polling = PollingSet::new();
        polling.refresh(&cache, now(), Duration::minutes(60));
        cache.remove(&QuakeId::from("vanishing"));

        let cutoff = Some(now() - Duration::minutes(10));
        let hints = polling.candidates(&cache, cutoff);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].id().as_str(), "due");
        assert!(polling.contains(&QuakeId::from("covered")));
        assert!(!polling.contains(&QuakeId::from("vanishing")));
    }

    #[test]
    fn deleted_answer_removes_record() {
        let mut cache = CacheStore::new();
        cache.upsert(quake("a", 30));
        let mut polling = PollingSet::new();
        polling.refresh(&cache, now(), Duration::minutes(60));
        let mut diff = CycleDiff::new();
        diff.mark_updated(&QuakeId::from("a"));

        let id = QuakeId::from("a");
        let outcome = apply_fetch(
            &mut cache,
            &mut polling,
            &id,
            Ok(Some(quake("a", 30).with_quality(Quality::Deleted))),
            &mut diff,
        );
        assert_eq!(outcome, FetchOutcome::Removed);
        assert!(!cache.contains(&id));
        assert!(polling.is_empty());
        let report = diff.into_report(&cache);
        assert!(report.updated_quakes.is_empty());
        assert_eq!(report.old_quake_ids, vec![id]);
    }

    #[test]
    fn best_answer_updates_and_ends_polling() {
        let mut cache = CacheStore::new();
        cache.upsert(quake("a", 30));
        let mut polling = PollingSet::new();
        polling.refresh(&cache, now(), Duration::minutes(60));
        let mut diff = CycleDiff::new();

        let id = QuakeId::from("a");
        let outcome = apply_fetch(
            &mut cache,
            &mut polling,
            &id,
            Ok(Some(quake("a", 30).with_quality(Quality::Best))),
            &mut diff,
        );
        assert_eq!(outcome, FetchOutcome::Updated);
        assert!(!polling.contains(&id));
        assert_eq!(cache.get(&id).unwrap().quality(), Some(Quality::Best));
    }

    #[test]
    fn failures_and_empty_answers_change_nothing() {
        let mut cache = CacheStore::new();
        cache.upsert(quake("a", 30));
        let mut polling = PollingSet::new();
        polling.refresh(&cache, now(), Duration::minutes(60));
        let mut diff = CycleDiff::new();
        let id = QuakeId::from("a");

        let failed = apply_fetch(
            &mut cache,
            &mut polling,
            &id,
            Err(FeedError::UpstreamUnavailable("timeout".to_owned())),
            &mut diff,
        );
        let empty = apply_fetch(&mut cache, &mut polling, &id, Ok(None), &mut diff);
        assert_eq!(failed, FetchOutcome::Unchanged);
        assert_eq!(empty, FetchOutcome::Unchanged);
        assert!(polling.contains(&id));
        assert!(diff.into_report(&cache).updated_quakes.is_empty());
    }
}
