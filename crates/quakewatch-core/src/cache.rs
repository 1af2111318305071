//! The authoritative set of tracked earthquake records.
//!
//! [`CacheStore`] owns every [`QuakeRecord`] the service knows about,
//! indexed by [`QuakeId`]. Listings come back in observation order: the
//! order in which each id was first inserted. Records are mutated in place
//! through [`CacheStore::get_mut`] or [`Upsert::Existing`]; they are never
//! replaced wholesale.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use quakewatch_types::{QuakeId, QuakeRecord};

/// Outcome of [`CacheStore::upsert`].
#[derive(Debug)]
pub enum Upsert<'a> {
    /// The record was new and has been inserted.
    Inserted,
    /// A record with this id already exists; it is returned unmodified.
    Existing(&'a mut QuakeRecord),
}

/// Records keyed by identity, listed in observation order.
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    /// Observation sequence number to record.
    records: BTreeMap<u64, QuakeRecord>,
    /// Identity to observation sequence number.
    index: HashMap<QuakeId, u64>,
    next_seq: u64,
}

impl CacheStore {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with a decoded snapshot.
    ///
    /// Snapshot order becomes observation order. If the snapshot repeats an
    /// id, the first occurrence wins.
    pub fn load(&mut self, records: Vec<QuakeRecord>) {
        self.clear();
        for record in records {
            if !self.index.contains_key(record.id()) {
                self.insert(record);
            }
        }
    }

    /// Insert `record` if its id is unknown; otherwise hand back the
    /// existing record untouched so the caller can decide how to merge.
    pub fn upsert(&mut self, record: QuakeRecord) -> Upsert<'_> {
        let existing = self
            .index
            .get(record.id())
            .copied()
            .filter(|seq| self.records.contains_key(seq));
        match existing {
            Some(seq) => self
                .records
                .get_mut(&seq)
                .map_or(Upsert::Inserted, Upsert::Existing),
            None => {
                self.insert(record);
                Upsert::Inserted
            }
        }
    }

    fn insert(&mut self, record: QuakeRecord) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.index.insert(record.id().clone(), seq);
        self.records.insert(seq, record);
    }

    /// Look up a record.
    pub fn get(&self, id: &QuakeId) -> Option<&QuakeRecord> {
        self.index.get(id).and_then(|seq| self.records.get(seq))
    }

    /// Look up a record for in-place update.
    pub fn get_mut(&mut self, id: &QuakeId) -> Option<&mut QuakeRecord> {
        let seq = self.index.get(id)?;
        self.records.get_mut(seq)
    }

    /// Whether `id` is cached.
    pub fn contains(&self, id: &QuakeId) -> bool {
        self.index.contains_key(id)
    }

    /// Remove a record; a missing id is a no-op.
    pub fn remove(&mut self, id: &QuakeId) -> Option<QuakeRecord> {
        let seq = self.index.remove(id)?;
        self.records.remove(&seq)
    }

    /// Remove every listed id. Returns how many were present.
    pub fn remove_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a QuakeId>) -> usize {
        ids.into_iter()
            .filter(|id| self.remove(id).is_some())
            .count()
    }

    /// Iterate over records in observation order.
    pub fn iter(&self) -> impl Iterator<Item = &QuakeRecord> {
        self.records.values()
    }

    /// Copy of every record in observation order.
    pub fn all(&self) -> Vec<QuakeRecord> {
        self.records.values().cloned().collect()
    }

    /// Remove every record whose origin time is strictly before
    /// `now - ttl` and return their ids in observation order.
    ///
    /// A record exactly at the cutoff is kept. Records without an origin
    /// time cannot be aged and are kept.
    pub fn expire(&mut self, ttl: Duration, now: DateTime<Utc>) -> Vec<QuakeId> {
        let cutoff = now
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let expired: Vec<QuakeId> = self
            .records
            .values()
            .filter(|record| record.time().is_some_and(|time| time < cutoff))
            .map(|record| record.id().clone())
            .collect();
        self.remove_all(&expired);
        expired
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use quakewatch_types::Quality;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-10T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn record(id: &str, time: DateTime<Utc>) -> QuakeRecord {
        QuakeRecord::new(id).with_time(time).with_magnitude(3.0)
    }

    fn ids(cache: &CacheStore) -> Vec<String> {
        cache.iter().map(|r| r.id().as_str().to_owned()).collect()
    }

    #[test]
    fn upsert_inserts_then_returns_existing_unmodified() {
        let mut cache = CacheStore::new();
        assert!(matches!(cache.upsert(record("a", now())), Upsert::Inserted));

        let newer = record("a", now()).with_magnitude(6.0);
        match cache.upsert(newer) {
            Upsert::Existing(existing) => assert_eq!(existing.magnitude(), Some(3.0)),
            Upsert::Inserted => panic!("expected existing record"),
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn listing_keeps_observation_order_across_removals() {
        let mut cache = CacheStore::new();
        for id in ["c", "a", "b", "d"] {
            cache.upsert(record(id, now()));
        }
        cache.remove(&QuakeId::from("a"));
        cache.upsert(record("a", now()));
        assert_eq!(ids(&cache), ["c", "b", "d", "a"]);
    }

    #[test]
    fn remove_is_noop_for_unknown_ids() {
        let mut cache = CacheStore::new();
        cache.upsert(record("a", now()));
        assert!(cache.remove(&QuakeId::from("zzz")).is_none());
        let removed = cache.remove_all(&[QuakeId::from("a"), QuakeId::from("b")]);
        assert_eq!(removed, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn expiry_boundary_is_exact() {
        let ttl = Duration::days(7);
        let cutoff = now() - ttl;
        let mut cache = CacheStore::new();
        cache.upsert(record("at-cutoff", cutoff));
        cache.upsert(record("just-older", cutoff - Duration::milliseconds(1)));
        cache.upsert(record("fresh", now()));
        cache.upsert(QuakeRecord::new("untimed"));

        let expired = cache.expire(ttl, now());
        assert_eq!(expired, vec![QuakeId::from("just-older")]);
        assert_eq!(ids(&cache), ["at-cutoff", "fresh", "untimed"]);
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut cache = CacheStore::new();
        cache.upsert(record("a", now()));
        let patch = QuakeRecord::new("a").with_quality(Quality::Best);
        assert!(cache.get_mut(&QuakeId::from("a")).unwrap().update(&patch));
        assert_eq!(
            cache.get(&QuakeId::from("a")).unwrap().quality(),
            Some(Quality::Best)
        );
    }

    #[test]
    fn load_replaces_contents_and_drops_duplicates() {
        let mut cache = CacheStore::new();
        cache.upsert(record("old", now()));
        cache.load(vec![
            record("x", now()),
            record("y", now()),
            record("x", now()).with_magnitude(9.0),
        ]);
        assert_eq!(ids(&cache), ["x", "y"]);
        assert_eq!(cache.get(&QuakeId::from("x")).unwrap().magnitude(), Some(3.0));
        assert!(!cache.contains(&QuakeId::from("old")));
    }
}
