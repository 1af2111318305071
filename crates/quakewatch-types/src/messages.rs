//! Messages exchanged with live-update subscribers.
//!
//! Every frame on the wire is a two-element JSON array
//! `[event_name, payload]`. The server side is modelled by
//! [`ServerEvent`], which serializes straight into that shape; inbound
//! frames decode into [`ClientCommand`].

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use ts_rs::TS;

use crate::ids::QuakeId;
use crate::quake::QuakeRecord;

/// Aggregate connection and cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Stats {
    /// Number of cached events.
    pub quakes: usize,
    /// Open subscriber sessions.
    pub connected_clients: usize,
    /// Highest number of simultaneously open sessions.
    pub connected_clients_peak: usize,
    /// Distinct client identifiers among open sessions.
    pub unique_connections: usize,
    /// Highest number of distinct client identifiers seen at once.
    pub unique_connections_peak: usize,
}

/// Query settings reported to clients on `sync`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ClientConfig {
    /// Smallest magnitude included in searches.
    pub min_magnitude: f64,
    /// Deepest event included in searches, in kilometres (0 = no limit).
    pub max_depth_km: f64,
    /// Minutes during which an event is highlighted as recent.
    pub highlight_quakes_within: u64,
    /// Days of history kept in the cache.
    pub search_within: u64,
}

/// Reply to a client `ping`, carrying round-trip timing in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Pong {
    /// The client's timestamp, echoed back.
    pub then: i64,
    /// Server time when the ping was handled.
    pub now: i64,
    /// `now - then`.
    pub diff: i64,
}

/// Result of one refresh cycle, as returned by the manual resync endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SyncReport {
    /// Records that are new or changed, in their final cached state.
    pub updated_quakes: Vec<QuakeRecord>,
    /// Identities removed from the cache this cycle.
    pub old_quake_ids: Vec<QuakeId>,
}

/// An outbound message to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Current aggregate statistics.
    Stats(Stats),
    /// New or changed records.
    NewQuakes(Vec<QuakeRecord>),
    /// Identities that left the cache.
    OldQuakes(Vec<QuakeId>),
    /// Query settings.
    Config(ClientConfig),
    /// The full current listing.
    AllQuakes(Vec<QuakeRecord>),
    /// Reply to a client ping.
    Pong(Pong),
    /// Liveness probe carrying the server time in milliseconds.
    Ping(i64),
}

impl ServerEvent {
    /// The event name written as the first array element.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stats(_) => "stats",
            Self::NewQuakes(_) => "new_quakes",
            Self::OldQuakes(_) => "old_quakes",
            Self::Config(_) => "config",
            Self::AllQuakes(_) => "all_quakes",
            Self::Pong(_) => "pong",
            Self::Ping(_) => "ping",
        }
    }

    /// Serialize into a text frame.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if a payload cannot be encoded
    /// (for example a non-finite float).
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for ServerEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(self.name())?;
        match self {
            Self::Stats(stats) => tuple.serialize_element(stats)?,
            Self::NewQuakes(records) | Self::AllQuakes(records) => {
                tuple.serialize_element(records)?;
            }
            Self::OldQuakes(ids) => tuple.serialize_element(ids)?,
            Self::Config(config) => tuple.serialize_element(config)?,
            Self::Pong(pong) => tuple.serialize_element(pong)?,
            Self::Ping(now) => tuple.serialize_element(now)?,
        }
        tuple.end()
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Request for configuration and the full listing.
    Sync,
    /// Liveness echo with the client's millisecond timestamp.
    Ping(i64),
    /// Any other command name; ignored by the server.
    Other(String),
}

impl ClientCommand {
    /// Decode a `[name, payload]` text frame.
    ///
    /// A `ping` whose payload is not an integer decodes as
    /// [`ClientCommand::Other`] so it is ignored rather than answered
    /// with bogus timing.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the frame is not a two-element
    /// array starting with a string.
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        let (name, payload): (String, serde_json::Value) = serde_json::from_str(frame)?;
        Ok(match name.as_str() {
            "sync" => Self::Sync,
            "ping" => payload.as_i64().map_or(Self::Other(name), Self::Ping),
            _ => Self::Other(name),
        })
    }
}
