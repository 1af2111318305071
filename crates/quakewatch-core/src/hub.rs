//! Fan-out of server events to every open session.
//!
//! The hub owns the session table, per-client connection counts and the
//! peak counters behind [`Stats`]. Each broadcast serializes its event once
//! and delivers it to a snapshot of the table, so a session that
//! unregisters mid-broadcast is skipped rather than tripping the sweep.
//! Sessions whose queue has gone away are torn down after the pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use quakewatch_types::{ServerEvent, Stats};
use tracing::{debug, info, warn};

use crate::session::{FrameReceiver, Session};

#[derive(Debug, Default)]
struct HubInner {
    sessions: Vec<Arc<Session>>,
    /// Client identifier to open session count.
    clients: HashMap<String, usize>,
    connected_peak: usize,
    unique_peak: usize,
}

/// The set of open sessions and the statistics derived from it.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    inner: Mutex<HubInner>,
    /// Cache size reported in [`Stats::quakes`].
    quakes: AtomicUsize,
}

impl BroadcastHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open and register a session for `client`.
    ///
    /// Updated statistics are broadcast to every session, including the
    /// new one.
    pub fn register(&self, client: &str, now: DateTime<Utc>) -> (Arc<Session>, FrameReceiver) {
        let (session, rx) = Session::open(client, now);
        if let Ok(mut inner) = self.inner.lock() {
            inner.sessions.push(Arc::clone(&session));
            let count = inner.clients.entry(client.to_owned()).or_insert(0);
            *count = count.saturating_add(1);
            inner.connected_peak = inner.connected_peak.max(inner.sessions.len());
            inner.unique_peak = inner.unique_peak.max(inner.clients.len());
        }
        info!(session_id = %session.id(), client, "session opened");
        self.broadcast_stats(now);
        (session, rx)
    }

    /// Remove a session and broadcast updated statistics.
    ///
    /// Returns false, without broadcasting, if the session was already
    /// unregistered.
    pub fn unregister(&self, session: &Session, now: DateTime<Utc>) -> bool {
        if !self.detach(session) {
            return false;
        }
        self.broadcast_stats(now);
        true
    }

    /// Close `session` and drop it from the table. Idempotent.
    fn detach(&self, session: &Session) -> bool {
        session.begin_close();
        if !session.finish_close() {
            return false;
        }
        if let Ok(mut inner) = self.inner.lock() {
            let before = inner.sessions.len();
            inner.sessions.retain(|s| s.id() != session.id());
            if inner.sessions.len() < before {
                let client = session.client();
                if let Some(count) = inner.clients.get_mut(client) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        inner.clients.remove(client);
                    }
                }
            }
        }
        info!(session_id = %session.id(), client = session.client(), "session closed");
        true
    }

    /// Send `event` to every open session. Returns how many accepted it.
    pub fn broadcast(&self, event: &ServerEvent, now: DateTime<Utc>) -> usize {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize broadcast");
                return 0;
            }
        };
        let (delivered, failed) = self.deliver(&frame, now);
        debug!(event = event.name(), delivered, "broadcast");
        self.reap(failed, now);
        delivered
    }

    /// Send `event` to one session, tearing it down if the send fails.
    pub fn send(&self, session: &Session, event: &ServerEvent, now: DateTime<Utc>) -> bool {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize event");
                return false;
            }
        };
        match session.send(frame, now) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "direct send failed");
                self.unregister(session, now);
                false
            }
        }
    }

    /// Probe every session idle for longer than `threshold` with a
    /// `ping`. Never closes anything itself. Returns how many were probed.
    pub fn liveness_sweep(&self, now: DateTime<Utc>, threshold: Duration) -> usize {
        let probe = ServerEvent::Ping(now.timestamp_millis());
        let Ok(frame) = probe.to_frame() else {
            return 0;
        };
        let mut probed = 0_usize;
        let mut failed = Vec::new();
        for session in self.snapshot() {
            if !session.is_open() || !session.is_idle(now, threshold) {
                continue;
            }
            match session.send(frame.clone(), now) {
                Ok(()) => probed = probed.saturating_add(1),
                Err(_) => failed.push(session),
            }
        }
        if probed > 0 {
            debug!(probed, "liveness probes sent");
        }
        self.reap(failed, now);
        probed
    }

    /// Current statistics.
    pub fn stats(&self) -> Stats {
        let quakes = self.quakes.load(Ordering::Relaxed);
        self.inner.lock().map_or(
            Stats {
                quakes,
                ..Stats::default()
            },
            |inner| Stats {
                quakes,
                connected_clients: inner.sessions.len(),
                connected_clients_peak: inner.connected_peak,
                unique_connections: inner.clients.len(),
                unique_connections_peak: inner.unique_peak,
            },
        )
    }

    /// Set the cache size reported in statistics.
    pub fn set_quake_count(&self, count: usize) {
        self.quakes.store(count, Ordering::Relaxed);
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.sessions.len())
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner
            .lock()
            .map(|inner| inner.sessions.clone())
            .unwrap_or_default()
    }

    fn deliver(&self, frame: &str, now: DateTime<Utc>) -> (usize, Vec<Arc<Session>>) {
        let mut delivered = 0_usize;
        let mut failed = Vec::new();
        for session in self.snapshot() {
            if !session.is_open() {
                continue;
            }
            match session.send(frame.to_owned(), now) {
                Ok(()) => delivered = delivered.saturating_add(1),
                Err(_) => failed.push(session),
            }
        }
        (delivered, failed)
    }

    fn broadcast_stats(&self, now: DateTime<Utc>) {
        self.broadcast(&ServerEvent::Stats(self.stats()), now);
    }

    /// Tear down sessions whose sends failed, then tell the survivors.
    ///
    /// Each pass removes at least one session, so this terminates.
    fn reap(&self, mut failed: Vec<Arc<Session>>, now: DateTime<Utc>) {
        while !failed.is_empty() {
            let removed = failed
                .iter()
                .filter(|session| self.detach(session))
                .count();
            if removed == 0 {
                return;
            }
            let Ok(frame) = ServerEvent::Stats(self.stats()).to_frame() else {
                return;
            };
            failed = self.deliver(&frame, now).1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;
    use crate::session::{OUTBOUND_QUEUE_CAPACITY, SessionState};
    use quakewatch_types::QuakeId;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_709_287_200_000).unwrap()
    }

    fn drain(rx: &mut FrameReceiver) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn register_counts_peaks_and_unique_clients() {
        let hub = BroadcastHub::new();
        let (a, mut rx_a) = hub.register("10.0.0.1", now());
        let (b, _rx_b) = hub.register("10.0.0.1", now());
        let (_c, _rx_c) = hub.register("10.0.0.2", now());

        let stats = hub.stats();
        assert_eq!(stats.connected_clients, 3);
        assert_eq!(stats.unique_connections, 2);

        hub.unregister(&a, now());
        hub.unregister(&b, now());
        let stats = hub.stats();
        assert_eq!(stats.connected_clients, 1);
        assert_eq!(stats.connected_clients_peak, 3);
        assert_eq!(stats.unique_connections, 1);
        assert_eq!(stats.unique_connections_peak, 2);

        // a saw its own registration plus the two that followed
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.starts_with(r#"["stats","#)));
    }

    #[test]
    fn unregister_is_idempotent() {
        let hub = BroadcastHub::new();
        let (a, _rx_a) = hub.register("x", now());
        let (_b, mut rx_b) = hub.register("y", now());
        drain(&mut rx_b);

        assert!(hub.unregister(&a, now()));
        assert!(!hub.unregister(&a, now()));
        assert_eq!(hub.stats().unique_connections, 1);
        // one stats broadcast, not two
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn failed_session_is_torn_down_without_stopping_delivery() {
        let hub = BroadcastHub::new();
        let (_dead, rx_dead) = hub.register("dead", now());
        let (_live, mut rx_live) = hub.register("live", now());
        drop(rx_dead);
        drain(&mut rx_live);

        let delivered = hub.broadcast(&ServerEvent::OldQuakes(vec![QuakeId::from("q")]), now());
        assert_eq!(delivered, 1);
        assert_eq!(hub.session_count(), 1);

        let frames = drain(&mut rx_live);
        assert_eq!(frames.first().unwrap(), r#"["old_quakes",["q"]]"#);
        // followed by the stats announcing the teardown
        assert!(frames.get(1).unwrap().starts_with(r#"["stats","#));
    }

    #[test]
    fn session_that_stops_draining_is_torn_down() {
        let hub = BroadcastHub::new();
        let (slow, _rx_slow) = hub.register("slow", now());
        let (_live, mut rx_live) = hub.register("live", now());

        let event = ServerEvent::OldQuakes(vec![QuakeId::from("q")]);
        let mut delivered = 0;
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            delivered = hub.broadcast(&event, now());
            drain(&mut rx_live);
        }
        assert_eq!(delivered, 1);
        assert_eq!(hub.session_count(), 1);
        assert_eq!(slow.state(), SessionState::Closed);
        assert_eq!(hub.stats().connected_clients, 1);
    }

    #[test]
    fn unregistered_session_receives_nothing() {
        let hub = BroadcastHub::new();
        let (gone, mut rx_gone) = hub.register("a", now());
        let (_kept, _rx_kept) = hub.register("b", now());
        drain(&mut rx_gone);

        hub.unregister(&gone, now());
        hub.broadcast(&ServerEvent::Ping(1), now());
        assert!(drain(&mut rx_gone).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn broadcast_races_with_unregister() {
        let hub = Arc::new(BroadcastHub::new());
        let mut sessions = Vec::new();
        for i in 0..32 {
            sessions.push(hub.register(&format!("client-{i}"), now()));
        }

        let broadcaster = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                for i in 0..50 {
                    hub.broadcast(&ServerEvent::Ping(i), now());
                    tokio::task::yield_now().await;
                }
            })
        };
        for (session, _) in &sessions {
            hub.unregister(session, now());
            tokio::task::yield_now().await;
        }
        broadcaster.await.unwrap();

        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.stats().connected_clients_peak, 32);
        assert_eq!(hub.broadcast(&ServerEvent::Ping(0), now()), 0);
        for (session, rx) in &mut sessions {
            assert!(!session.is_open());
            while rx.try_recv().is_ok() {}
        }
        assert_eq!(hub.broadcast(&ServerEvent::Ping(1), now()), 0);
    }

    #[test]
    fn sweep_probes_only_idle_sessions() {
        let hub = BroadcastHub::new();
        let threshold = Duration::milliseconds(600_000);
        let (_idle, mut rx_idle) = hub.register("idle", now());
        let later = now() + threshold + Duration::seconds(1);
        let (_fresh, mut rx_fresh) = hub.register("fresh", later);
        drain(&mut rx_idle);
        drain(&mut rx_fresh);

        // the stats broadcast for "fresh" touched "idle" at `later` as well
        assert_eq!(hub.liveness_sweep(later, threshold), 0);

        let much_later = later + threshold + Duration::seconds(1);
        assert_eq!(hub.liveness_sweep(much_later, threshold), 2);
        let frame = drain(&mut rx_idle).pop().unwrap();
        assert_eq!(frame, format!(r#"["ping",{}]"#, much_later.timestamp_millis()));
        assert_eq!(hub.session_count(), 2);
    }
}
