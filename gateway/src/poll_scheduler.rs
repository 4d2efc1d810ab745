//! GPS Poll Scheduler, Jimi only (spec.md §4.5).
//!
//! Modelled as the "lightweight task with `select { tick, cancel }`
//! semantics" spec.md §9 allows: a `tokio::spawn`ed task per session that
//! owns its own phase state machine and writes request-location frames
//! through an `mpsc` channel into the connection's write half, rather than
//! locking a shared socket — the same channel-into-owning-task shape the
//! teacher uses for UWB hub events (`uwb_hub::OcsEvent` → `ocs_tx`).

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::codec::jimi::encode_request_location;

const AGGRESSIVE_INTERVAL: Duration = Duration::from_secs(15);
const AGGRESSIVE_MAX_FIRES: u8 = 6;
const STEADY_INTERVAL: Duration = Duration::from_secs(60);
const STEADY_SILENCE_THRESHOLD: Duration = Duration::from_secs(90);
const IDLE_INTERVAL: Duration = Duration::from_secs(300);
const IDLE_SILENCE_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Aggressive,
    Steady,
    Idle,
}

/// A handle the owning Session uses to cancel the scheduler. Cancellation is
/// synchronous with Session close (spec.md §4.5): once `cancel` returns, no
/// further fire can reach the write channel — the task observes the flag via
/// `Notify` before every tick, matching spec.md §9's "let the scheduler
/// observe a closed flag before each fire".
pub struct PollSchedulerHandle {
    cancel: Arc<Notify>,
}

impl PollSchedulerHandle {
    pub fn cancel(&self) {
        self.cancel.notify_waiters();
    }
}

/// Shared state the scheduler reads to decide whether the device has started
/// reporting autonomously. Updated by the connection worker whenever a valid
/// GpsFix arrives (spec.md §4.3 "Polling + GpsFix (valid) → notify Poll
/// Scheduler").
pub struct FixClock {
    last_fix_at: std::sync::Mutex<Option<Instant>>,
}

impl FixClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_fix_at: std::sync::Mutex::new(None),
        })
    }

    pub fn record_fix(&self) {
        *self.last_fix_at.lock().unwrap() = Some(Instant::now());
    }

    fn since_last_fix(&self) -> Option<Duration> {
        self.last_fix_at.lock().unwrap().map(|t| t.elapsed())
    }
}

/// Spawns the scheduler task for one Jimi session (spec.md §3 invariant:
/// exactly one scheduler exists per session at any time — callers must not
/// call this twice for the same Session without cancelling the first).
pub fn spawn(
    write_tx: mpsc::Sender<Vec<u8>>,
    next_serial: Arc<AtomicU16>,
    fix_clock: Arc<FixClock>,
) -> PollSchedulerHandle {
    let cancel = Arc::new(Notify::new());
    let cancel_task = cancel.clone();
    tokio::spawn(async move {
        run(write_tx, next_serial, fix_clock, cancel_task).await;
    });
    PollSchedulerHandle { cancel }
}

async fn sleep_or_cancelled(dur: Duration, cancel: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = cancel.notified() => true,
    }
}

async fn fire(write_tx: &mpsc::Sender<Vec<u8>>, next_serial: &AtomicU16) -> bool {
    let serial = next_serial.fetch_add(1, Ordering::SeqCst);
    let frame = encode_request_location(serial);
    write_tx.send(frame).await.is_ok()
}

async fn run(
    write_tx: mpsc::Sender<Vec<u8>>,
    next_serial: Arc<AtomicU16>,
    fix_clock: Arc<FixClock>,
    cancel: Arc<Notify>,
) {
    // Aggressive: fire immediately on entry, then every 15s, up to 6 fires.
    for fire_count in 0..AGGRESSIVE_MAX_FIRES {
        if !fire(&write_tx, &next_serial).await {
            return;
        }
        debug!(phase = ?Phase::Aggressive, fire_count, "poll scheduler fired");
        if fire_count + 1 == AGGRESSIVE_MAX_FIRES {
            break;
        }
        if sleep_or_cancelled(AGGRESSIVE_INTERVAL, &cancel).await {
            return;
        }
    }

    // Steady: every 60s, poll only if the device has gone quiet ≥90s;
    // otherwise the device is reporting autonomously — hand off to Idle.
    loop {
        if sleep_or_cancelled(STEADY_INTERVAL, &cancel).await {
            return;
        }
        match fix_clock.since_last_fix() {
            Some(age) if age < STEADY_SILENCE_THRESHOLD => {
                debug!("device reporting autonomously, handing off to idle phase");
                break;
            }
            _ => {
                if !fire(&write_tx, &next_serial).await {
                    return;
                }
                debug!(phase = ?Phase::Steady, "poll scheduler fired");
            }
        }
    }

    // Idle: every 300s, poll only if silent for the full window.
    loop {
        if sleep_or_cancelled(IDLE_INTERVAL, &cancel).await {
            return;
        }
        let silent = match fix_clock.since_last_fix() {
            Some(age) => age >= IDLE_SILENCE_THRESHOLD,
            None => true,
        };
        if silent {
            if !fire(&write_tx, &next_serial).await {
                return;
            }
            debug!(phase = ?Phase::Idle, "poll scheduler fired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggressive_phase_fires_immediately_then_cancels_cleanly() {
        let (tx, mut rx) = mpsc::channel(16);
        let next_serial = Arc::new(AtomicU16::new(1));
        let fix_clock = FixClock::new();
        let handle = spawn(tx, next_serial, fix_clock);

        let first = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("first fire within 500ms")
            .expect("channel open");
        assert_eq!(first[3], 0x80, "request-location uses protocol 0x80");

        handle.cancel();
    }

    #[test]
    fn fix_clock_reports_recency() {
        let clock = FixClock::new();
        assert!(clock.since_last_fix().is_none());
        clock.record_fix();
        assert!(clock.since_last_fix().unwrap() < Duration::from_secs(1));
    }
}
