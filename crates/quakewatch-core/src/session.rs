//! One live-update subscriber.
//!
//! A [`Session`] is the engine-side handle of a connected socket. Frames
//! are queued on a bounded channel of [`OUTBOUND_QUEUE_CAPACITY`] frames;
//! the transport task that owns the socket drains the receiver, so writes
//! to one socket never interleave. A subscriber that lets its queue fill
//! up is treated like one that went away.
//!
//! State only moves forward: `open → closing → closed`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use chrono::{DateTime, Duration, Utc};
use quakewatch_types::SessionId;
use tokio::sync::mpsc;

/// Frames a session may have queued before it counts as failed.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Queue side of a session's outbound frames.
pub type FrameReceiver = mpsc::Receiver<String>;

/// A frame could not be queued: the transport side went away or stopped
/// draining its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("send to session {session} failed")]
pub struct SessionSendFailure {
    /// The session that failed.
    pub session: SessionId,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting frames.
    Open,
    /// Being torn down; sends are dropped.
    Closing,
    /// Removed from the hub.
    Closed,
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// A connected subscriber.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    client: String,
    state: AtomicU8,
    /// Epoch milliseconds of the last frame in either direction.
    last_activity_ms: AtomicI64,
    tx: mpsc::Sender<String>,
}

impl Session {
    /// Open a session for `client` and return it with its frame queue.
    pub fn open(client: impl Into<String>, now: DateTime<Utc>) -> (Arc<Self>, FrameReceiver) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Arc::new(Self {
            id: SessionId::new(),
            client: client.into(),
            state: AtomicU8::new(OPEN),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            tx,
        });
        (session, rx)
    }

    /// Session identifier.
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Client identifier used for unique-connection counting.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            OPEN => SessionState::Open,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Whether frames are still accepted.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Queue a text frame.
    ///
    /// Sending on a session that is no longer open is a silent no-op. A
    /// closed or full queue moves the session to `closing` and reports
    /// failure.
    pub fn send(&self, frame: String, now: DateTime<Utc>) -> Result<(), SessionSendFailure> {
        if !self.is_open() {
            return Ok(());
        }
        if self.tx.try_send(frame).is_err() {
            self.begin_close();
            return Err(SessionSendFailure { session: self.id });
        }
        self.touch(now);
        Ok(())
    }

    /// Record activity at `now`.
    pub fn touch(&self, now: DateTime<Utc>) {
        self.last_activity_ms
            .fetch_max(now.timestamp_millis(), Ordering::AcqRel);
    }

    /// Time of the last frame in either direction.
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Acquire))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether no frame has moved for longer than `threshold`.
    pub fn is_idle(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.signed_duration_since(self.last_activity()) > threshold
    }

    /// Move `open → closing`. Returns false if already past `open`.
    pub fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `closed`. Returns false if it was already closed.
    pub fn finish_close(&self) -> bool {
        self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED
    }
}
