//! Shared type definitions for QuakeWatch.
//!
//! This crate is the single source of truth for the types that cross
//! crate boundaries: the cached event record, identifiers, and the wire
//! messages exchanged with live-update subscribers. Types flow to
//! `TypeScript` via `ts-rs` for the browser map client.
//!
//! # Modules
//!
//! - [`ids`] -- Provider event ids and subscriber session ids
//! - [`quake`] -- [`QuakeRecord`] with its match/merge semantics, and [`Quality`]
//! - [`messages`] -- Outbound [`ServerEvent`]s, inbound [`ClientCommand`]s, stats

pub mod ids;
pub mod messages;
pub mod quake;

// Re-export all public types at crate root for convenience.
pub use ids::{QuakeId, SessionId};
pub use messages::{ClientCommand, ClientConfig, Pong, ServerEvent, Stats, SyncReport};
pub use quake::{Quality, QuakeRecord};
