//! Identifier types.
//!
//! [`QuakeId`] wraps the opaque string the seismic provider assigns to an
//! event (GeoNet `publicid`). It is the only key used for equality and
//! cache indexing. [`SessionId`] identifies one live-update subscriber
//! connection and never leaves the process.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Provider-assigned identity of an earthquake event.
///
/// Immutable for the life of the record. Serialized transparently as the
/// raw string so the browser client sees the provider's id unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export, export_to = "bindings/")]
pub struct QuakeId(String);

impl QuakeId {
    /// Wrap a provider id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw provider id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for QuakeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QuakeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for QuakeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unique identifier for a subscriber session.
///
/// Uses UUID v7 so ids sort by connection time in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new session identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Return the inner [`Uuid`] value.
    pub const fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
