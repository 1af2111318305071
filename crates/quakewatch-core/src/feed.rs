//! Upstream feed contract and the scripted stub implementation.
//!
//! The engine talks to the seismic provider through [`FeedSource`]: a bulk
//! search and a single-event fetch. Enum dispatch is used instead of trait
//! objects because async methods are not dyn-compatible in Rust.
//!
//! Both kinds of non-success (transport failure and "no such event") are
//! treated as "no data this cycle" by the engine; only a returned record
//! carrying the `deleted` quality removes anything.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use quakewatch_types::{QuakeId, QuakeRecord};

use crate::geonet::GeoNetClient;

/// Errors returned by a feed source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Network failure, timeout, or a non-success HTTP status.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The provider answered with a body of unexpected shape.
    #[error("malformed upstream payload: {0}")]
    MalformedPayload(String),
}

/// Parameters of a bulk search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchQuery {
    /// Earliest origin time to include.
    pub from: DateTime<Utc>,
    /// Smallest magnitude to include (0 = no filter).
    pub min_magnitude: f64,
    /// Deepest event to include in kilometres (0 = no filter).
    pub max_depth_km: f64,
}

/// A source of earthquake records.
#[derive(Debug, Clone)]
pub enum FeedSource {
    /// The GeoNet HTTP API.
    GeoNet(GeoNetClient),
    /// Scripted responses, for tests and offline runs.
    Stub(StubFeed),
}

impl FeedSource {
    /// Search for every event matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError`] if the provider cannot be reached or answers
    /// with an unusable body.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<QuakeRecord>, FeedError> {
        match self {
            Self::GeoNet(client) => client.search(query).await,
            Self::Stub(stub) => {
                let delay = stub.begin_search();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                stub.search(query)
            }
        }
    }

    /// Fetch the provider's current state of one event.
    ///
    /// `hint` is the cached record, if any; fields the single-event
    /// response does not carry are taken from it. Returns `Ok(None)` when
    /// the provider has no such event.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError`] if the provider cannot be reached or answers
    /// with an unusable body.
    pub async fn fetch_one(
        &self,
        id: &QuakeId,
        hint: Option<&QuakeRecord>,
    ) -> Result<Option<QuakeRecord>, FeedError> {
        match self {
            Self::GeoNet(client) => client.fetch_one(id, hint).await,
            Self::Stub(stub) => stub.fetch_one(id),
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GeoNet(_) => "geonet",
            Self::Stub(_) => "stub",
        }
    }
}

#[derive(Debug, Default)]
struct StubInner {
    searches: VecDeque<Result<Vec<QuakeRecord>, FeedError>>,
    fetches: HashMap<QuakeId, Result<Option<QuakeRecord>, FeedError>>,
    search_log: Vec<SearchQuery>,
    fetch_log: Vec<QuakeId>,
    search_delay: Duration,
    searches_in_flight: usize,
    searches_in_flight_peak: usize,
}

/// A feed that replays scripted answers.
///
/// Search answers are consumed in order; once the queue is empty every
/// search returns an empty list. Fetch answers are keyed by id and stay in
/// place until replaced; an id without an answer fetches as `None`.
/// A search delay holds every search open for that long before it
/// answers. Clones share the same script and call log.
#[derive(Debug, Clone, Default)]
pub struct StubFeed {
    inner: Arc<Mutex<StubInner>>,
}

impl StubFeed {
    /// Create a stub with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer for the next search.
    pub fn push_search(&self, records: Vec<QuakeRecord>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.searches.push_back(Ok(records));
        }
    }

    /// Queue a transport failure for the next search.
    pub fn push_search_failure(&self, reason: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .searches
                .push_back(Err(FeedError::UpstreamUnavailable(reason.to_owned())));
        }
    }

    /// Set the answer for fetches of `id`.
    pub fn set_fetch(&self, id: &QuakeId, record: Option<QuakeRecord>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fetches.insert(id.clone(), Ok(record));
        }
    }

    /// Make fetches of `id` fail.
    pub fn set_fetch_failure(&self, id: &QuakeId, reason: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fetches.insert(
                id.clone(),
                Err(FeedError::UpstreamUnavailable(reason.to_owned())),
            );
        }
    }

    /// Hold each subsequent search open for `delay` before answering.
    pub fn set_search_delay(&self, delay: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.search_delay = delay;
        }
    }

    /// Most searches that were ever open at the same time.
    pub fn peak_concurrent_searches(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.searches_in_flight_peak)
            .unwrap_or_default()
    }

    /// Every search answered so far, in answer order.
    pub fn searches(&self) -> Vec<SearchQuery> {
        self.inner
            .lock()
            .map(|inner| inner.search_log.clone())
            .unwrap_or_default()
    }

    /// Every single-event fetch issued so far, in call order.
    pub fn fetched(&self) -> Vec<QuakeId> {
        self.inner
            .lock()
            .map(|inner| inner.fetch_log.clone())
            .unwrap_or_default()
    }

    fn begin_search(&self) -> Duration {
        let Ok(mut inner) = self.inner.lock() else {
            return Duration::ZERO;
        };
        inner.searches_in_flight = inner.searches_in_flight.saturating_add(1);
        inner.searches_in_flight_peak = inner
            .searches_in_flight_peak
            .max(inner.searches_in_flight);
        inner.search_delay
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<QuakeRecord>, FeedError> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(FeedError::UpstreamUnavailable("stub lock poisoned".to_owned()));
        };
        inner.searches_in_flight = inner.searches_in_flight.saturating_sub(1);
        inner.search_log.push(*query);
        inner.searches.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    fn fetch_one(&self, id: &QuakeId) -> Result<Option<QuakeRecord>, FeedError> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(FeedError::UpstreamUnavailable("stub lock poisoned".to_owned()));
        };
        inner.fetch_log.push(id.clone());
        inner.fetches.get(id).cloned().unwrap_or(Ok(None))
    }
}
