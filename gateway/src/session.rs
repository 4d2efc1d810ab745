//! Session State (spec.md §4.3) — per-connection device state machine.
//!
//! Owned exclusively by the connection worker that created it (spec.md §3,
//! "no other goroutine/thread writes it"); the admin surface only ever reads
//! a snapshot of `SessionStats` through the process-wide `SessionRegistry`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::poll_scheduler::{FixClock, PollSchedulerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    LoggedIn,
    Polling,
    Closed,
}

/// Per-connection device state (spec.md §3 "Session").
pub struct Session {
    pub imei: Option<String>,
    pub source_port: u16,
    pub remote_addr: SocketAddr,
    pub state: SessionState,
    /// Last serial number seen *from* the device.
    pub last_serial_seen: Option<u16>,
    /// Next serial this gateway will stamp on an outbound command toward the
    /// device — monotonic for the session's lifetime, shared with the poll
    /// scheduler task via the same atomic.
    pub next_serial: Arc<AtomicU16>,
    pub poll_scheduler: Option<PollSchedulerHandle>,
    /// Shared with the Poll Scheduler task so it can observe when the
    /// device last reported a valid fix (spec.md §4.5 phase transitions).
    pub fix_clock: Option<Arc<FixClock>>,
    pub last_fix_at: Option<Instant>,
    pub stats: Arc<SessionStats>,
}

impl Session {
    pub fn new(source_port: u16, remote_addr: SocketAddr) -> Self {
        Self {
            imei: None,
            source_port,
            remote_addr,
            state: SessionState::Connected,
            last_serial_seen: None,
            next_serial: Arc::new(AtomicU16::new(1)),
            poll_scheduler: None,
            fix_clock: None,
            last_fix_at: None,
            stats: Arc::new(SessionStats::default()),
        }
    }

    /// spec.md §3 invariant: IMEI is immutable once set by Login processing.
    pub fn stamp_imei(&mut self, imei: String) {
        if self.imei.is_none() {
            self.imei = Some(imei);
        }
    }

    pub fn mark_logged_in(&mut self) {
        if self.state == SessionState::Connected {
            self.state = SessionState::LoggedIn;
        }
    }

    pub fn mark_polling(&mut self) {
        self.state = SessionState::Polling;
    }

    pub fn mark_fix_received(&mut self) {
        self.last_fix_at = Some(Instant::now());
    }

    pub fn close(&mut self) {
        if let Some(sched) = self.poll_scheduler.take() {
            sched.cancel();
        }
        self.state = SessionState::Closed;
    }

    pub fn next_outbound_serial(&self) -> u16 {
        self.next_serial.fetch_add(1, Ordering::SeqCst)
    }
}

/// Per-session counters surfaced by `GET /jimi/stats` (spec.md §6).
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_received: AtomicU64,
    pub frames_acked: AtomicU64,
    pub framing_errors: AtomicU64,
}

impl SessionStats {
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.frames_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
pub struct SessionSnapshot {
    pub imei: Option<String>,
    pub source_port: u16,
    pub remote_addr: String,
    pub frames_received: u64,
    pub frames_acked: u64,
    pub framing_errors: u64,
    pub last_fix_age_secs: Option<u64>,
}

/// Process-wide registry of live sessions, injected into the Listener at
/// startup (spec.md §9 "inject the structure into the Listener at startup so
/// it is testable by substitution"). Entries are added when a connection
/// worker starts and removed when it exits.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<u64, SessionEntry>>,
}

struct SessionEntry {
    imei: Option<String>,
    source_port: u16,
    remote_addr: SocketAddr,
    stats: Arc<SessionStats>,
    last_fix_at: Option<Instant>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(
        &self,
        connection_id: u64,
        source_port: u16,
        remote_addr: SocketAddr,
        stats: Arc<SessionStats>,
    ) {
        self.inner.write().await.insert(
            connection_id,
            SessionEntry {
                imei: None,
                source_port,
                remote_addr,
                stats,
                last_fix_at: None,
            },
        );
    }

    pub async fn set_imei(&self, connection_id: u64, imei: String) {
        if let Some(entry) = self.inner.write().await.get_mut(&connection_id) {
            entry.imei = Some(imei);
        }
    }

    pub async fn record_fix(&self, connection_id: u64) {
        if let Some(entry) = self.inner.write().await.get_mut(&connection_id) {
            entry.last_fix_at = Some(Instant::now());
        }
    }

    pub async fn deregister(&self, connection_id: u64) {
        self.inner.write().await.remove(&connection_id);
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.inner
            .read()
            .await
            .values()
            .map(|e| SessionSnapshot {
                imei: e.imei.clone(),
                source_port: e.source_port,
                remote_addr: e.remote_addr.to_string(),
                frames_received: e.stats.frames_received.load(Ordering::Relaxed),
                frames_acked: e.stats.frames_acked.load(Ordering::Relaxed),
                framing_errors: e.stats.framing_errors.load(Ordering::Relaxed),
                last_fix_age_secs: e.last_fix_at.map(|t| t.elapsed().as_secs()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imei_is_stamped_once() {
        let mut session = Session::new(7000, "127.0.0.1:1".parse().unwrap());
        session.stamp_imei("123456789012345".to_string());
        session.stamp_imei("999999999999999".to_string());
        assert_eq!(session.imei.as_deref(), Some("123456789012345"));
    }

    #[test]
    fn close_cancels_scheduler_and_transitions_state() {
        let mut session = Session::new(7000, "127.0.0.1:1".parse().unwrap());
        session.mark_logged_in();
        session.close();
        assert_eq!(session.state, SessionState::Closed);
    }

    #[tokio::test]
    async fn registry_snapshot_reflects_registered_session() {
        let registry = SessionRegistry::new();
        let stats = Arc::new(SessionStats::default());
        stats.record_frame();
        registry
            .register(1, 7000, "127.0.0.1:2000".parse().unwrap(), stats)
            .await;
        registry.set_imei(1, "123456789012345".to_string()).await;

        let snap = registry.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].imei.as_deref(), Some("123456789012345"));
        assert_eq!(snap[0].frames_received, 1);

        registry.deregister(1).await;
        assert!(registry.snapshot().await.is_empty());
    }
}
