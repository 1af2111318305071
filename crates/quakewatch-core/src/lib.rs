//! Cache, refresh scheduling and subscriber fan-out for QuakeWatch.
//!
//! This crate owns the refresh cycle that keeps the earthquake cache in
//! step with the upstream provider and pushes every change to connected
//! subscribers.
//!
//! # Modules
//!
//! - [`cache`] -- [`CacheStore`], the authoritative record set in
//!   observation order.
//! - [`config`] -- Configuration loading from `quakewatch.yaml` plus
//!   environment overrides.
//! - [`engine`] -- [`QuakeEngine`], the refresh cycle and session entry
//!   points.
//! - [`feed`] -- [`FeedSource`] contract and the scripted [`StubFeed`].
//! - [`geonet`] -- HTTP client for the GeoNet APIs.
//! - [`hub`] -- [`BroadcastHub`], session table and statistics.
//! - [`scheduler`] -- Full/incremental planning, merge and per-record
//!   polling policy.
//! - [`session`] -- [`Session`] lifecycle and outbound frame queue.
//!
//! [`CacheStore`]: cache::CacheStore
//! [`QuakeEngine`]: engine::QuakeEngine
//! [`FeedSource`]: feed::FeedSource
//! [`StubFeed`]: feed::StubFeed
//! [`BroadcastHub`]: hub::BroadcastHub
//! [`Session`]: session::Session

pub mod cache;
pub mod config;
pub mod engine;
pub mod feed;
pub mod geonet;
pub mod hub;
pub mod scheduler;
pub mod session;

pub use config::{ConfigError, ServiceConfig};
pub use engine::QuakeEngine;
pub use feed::{FeedError, FeedSource, StubFeed};
pub use geonet::GeoNetClient;
pub use session::{FrameReceiver, Session, SessionSendFailure};
