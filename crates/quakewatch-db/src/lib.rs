//! Snapshot persistence for the QuakeWatch event cache.
//!
//! The engine keeps its authoritative state in memory and writes a
//! consistent post-cycle snapshot once per refresh cycle. This crate
//! provides the backends that snapshot lands in.
//!
//! # Architecture
//!
//! ```text
//! Refresh cycle
//!     |
//!     +-- merge / expire in memory
//!     |
//!     +-- end of cycle --> SnapshotStore
//!         |-- Dragonfly   (DragonflyPool, production)
//!         +-- Memory      (MemoryStore, tests and local runs)
//! ```
//!
//! # Modules
//!
//! - [`dragonfly`] -- `Dragonfly` (Redis-compatible) key/value operations
//! - [`memory`] -- In-process key/value store
//! - [`store`] -- The [`SnapshotStore`] contract used by the engine
//! - [`error`] -- Shared error types

pub mod dragonfly;
pub mod error;
pub mod memory;
pub mod store;

// Re-export primary types for convenience.
pub use dragonfly::DragonflyPool;
pub use error::DbError;
pub use memory::MemoryStore;
pub use store::{QUAKES_KEY, SnapshotStore, TimestampKey};
