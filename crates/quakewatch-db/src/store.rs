//! The snapshot persistence contract used by the engine.
//!
//! [`SnapshotStore`] dispatches over the concrete backends with an enum
//! because async methods are not dyn-compatible. The engine reads the
//! snapshot and both scheduler timestamps once at startup and writes them
//! once per refresh cycle.

use chrono::{DateTime, Utc};
use quakewatch_types::QuakeRecord;

use crate::dragonfly::DragonflyPool;
use crate::error::DbError;
use crate::memory::MemoryStore;

/// Key holding the serialized cache.
pub const QUAKES_KEY: &str = "quakes";

/// The two timestamps the refresh scheduler persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampKey {
    /// Time of the last successful bulk query.
    LastQuery,
    /// Time of the last successful full query.
    LastFullRefresh,
}

impl TimestampKey {
    /// The storage key for this timestamp.
    pub const fn key(self) -> &'static str {
        match self {
            Self::LastQuery => "last-query-time",
            Self::LastFullRefresh => "last-full-refresh",
        }
    }
}

/// A persistence backend for the event cache.
#[derive(Debug, Clone)]
pub enum SnapshotStore {
    /// Networked `Dragonfly`/Redis storage.
    Dragonfly(DragonflyPool),
    /// In-process storage (tests and local runs).
    Memory(MemoryStore),
}

impl SnapshotStore {
    /// Load the persisted cache.
    ///
    /// Returns an empty list when nothing has been stored yet. Entries that
    /// no longer decode are skipped with a warning rather than failing the
    /// whole load.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the backend read fails or the stored value is
    /// not a JSON array.
    pub async fn load_snapshot(&self) -> Result<Vec<QuakeRecord>, DbError> {
        let raw: Option<Vec<serde_json::Value>> = match self {
            Self::Dragonfly(pool) => pool.get_json(QUAKES_KEY).await?,
            Self::Memory(store) => store
                .get(QUAKES_KEY)
                .map(|json| serde_json::from_str(&json))
                .transpose()?,
        };
        Ok(decode_records(raw.unwrap_or_default()))
    }

    /// Replace the persisted cache with `records`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if serialization or the backend write fails.
    pub async fn save_snapshot(&self, records: &[QuakeRecord]) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(pool) => pool.set_json(QUAKES_KEY, &records).await,
            Self::Memory(store) => {
                store.set(QUAKES_KEY, serde_json::to_string(records)?);
                Ok(())
            }
        }
    }

    /// Drop the persisted cache.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the backend delete fails.
    pub async fn clear_snapshot(&self) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(pool) => pool.delete(QUAKES_KEY).await,
            Self::Memory(store) => {
                store.delete(QUAKES_KEY);
                Ok(())
            }
        }
    }

    /// Read a scheduler timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidValue`] if the stored value is not a valid
    /// millisecond timestamp, or [`DbError`] if the backend read fails.
    pub async fn get_timestamp(&self, key: TimestampKey) -> Result<Option<DateTime<Utc>>, DbError> {
        let millis = match self {
            Self::Dragonfly(pool) => pool.get_i64(key.key()).await?,
            Self::Memory(store) => store.get_i64(key.key())?,
        };
        millis
            .map(|ms| {
                DateTime::from_timestamp_millis(ms).ok_or_else(|| DbError::InvalidValue {
                    key: key.key().to_owned(),
                    reason: format!("{ms} is out of range"),
                })
            })
            .transpose()
    }

    /// Write a scheduler timestamp as epoch milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the backend write fails.
    pub async fn put_timestamp(&self, key: TimestampKey, value: DateTime<Utc>) -> Result<(), DbError> {
        let millis = value.timestamp_millis();
        match self {
            Self::Dragonfly(pool) => pool.set_i64(key.key(), millis).await,
            Self::Memory(store) => {
                store.set(key.key(), millis.to_string());
                Ok(())
            }
        }
    }
}

fn decode_records(values: Vec<serde_json::Value>) -> Vec<QuakeRecord> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<QuakeRecord>(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable persisted record");
                None
            }
        })
        .collect()
}
