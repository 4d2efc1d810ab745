//! Subscriber Fan-out (spec.md §4.6) — the process-wide `SubscriberSet`.
//!
//! The subscriber transport itself is an external collaborator (spec.md §1);
//! SPEC_FULL.md picks a concrete stand-in (`axum` WebSocket) so this module
//! has something real to drive. Delivery failure to one subscriber never
//! blocks or terminates delivery to others (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::codec::CellInfo;

/// The normalized fix fields handed to subscribers (spec.md §6): "imei, lat,
/// lon, timestamp, speed, course, satellites, positioned, valid, protocol
/// identifier, serial, source_port, optional cellInfo/ioElements".
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedFix {
    pub imei: String,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
    pub speed: f64,
    pub course: f64,
    pub satellites: u8,
    pub positioned: bool,
    pub valid: bool,
    pub protocol: &'static str,
    pub serial: Option<u16>,
    pub source_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell: Option<CellInfo>,
}

impl NormalizedFix {
    /// The message-type tag this fix is wrapped in on the wire (spec.md
    /// §4.6: "self-describing objects tagged by type (jimi-data, gps-data,
    /// alert-data, etc.)").
    fn message_type(&self) -> &'static str {
        match self.protocol {
            "jimi" => "jimi-data",
            _ => "gps-data",
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a NormalizedFix,
}

struct Subscriber {
    authenticated: bool,
    tx: mpsc::UnboundedSender<Message>,
}

/// Mapping from subscriber handle to `{authenticated}` (spec.md §3
/// "SubscriberSet"). Guarded by a single `RwLock` — spec.md §5 only requires
/// a "mapping-level lock", and the fan-out path does no blocking I/O while
/// holding it (sends are non-blocking `UnboundedSender::send`).
#[derive(Default)]
pub struct SubscriberRegistry {
    inner: RwLock<HashMap<Uuid, Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a new subscriber in the unauthenticated state (spec.md §3
    /// "entry added on subscriber attach (unauthenticated)").
    pub async fn attach(&self, tx: mpsc::UnboundedSender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.write().await.insert(
            id,
            Subscriber {
                authenticated: false,
                tx,
            },
        );
        id
    }

    /// Flips a subscriber to authenticated on successful token presentation.
    pub async fn authenticate(&self, id: Uuid) {
        if let Some(sub) = self.inner.write().await.get_mut(&id) {
            sub.authenticated = true;
        }
    }

    pub async fn detach(&self, id: Uuid) {
        self.inner.write().await.remove(&id);
    }

    /// Delivers `fix` to every authenticated subscriber whose channel is
    /// still writable; drops any subscriber whose send fails (spec.md §4.6
    /// "the subscriber is removed on I/O error").
    pub async fn publish(&self, fix: &NormalizedFix) {
        let envelope = Envelope {
            kind: fix.message_type(),
            data: fix,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                debug!("failed to serialize fix for fan-out: {e}");
                return;
            }
        };

        let mut dead = Vec::new();
        {
            let subs = self.inner.read().await;
            for (id, sub) in subs.iter() {
                if !sub.authenticated {
                    continue;
                }
                if sub.tx.send(Message::Text(payload.clone())).is_err() {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.inner.write().await;
            for id in dead {
                subs.remove(&id);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fix() -> NormalizedFix {
        NormalizedFix {
            imei: "123456789012345".to_string(),
            lat: 35.0,
            lon: -46.0,
            timestamp: Utc::now(),
            speed: 10.0,
            course: 90.0,
            satellites: 8,
            positioned: true,
            valid: true,
            protocol: "jimi",
            serial: Some(1),
            source_port: 7000,
            cell: None,
        }
    }

    #[tokio::test]
    async fn unauthenticated_subscriber_never_receives_a_fix() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach(tx).await;

        registry.publish(&sample_fix()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn authenticated_subscriber_receives_a_fix() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.attach(tx).await;
        registry.authenticate(id).await;

        registry.publish(&sample_fix()).await;
        let msg = rx.try_recv().expect("message delivered");
        match msg {
            Message::Text(s) => assert!(s.contains("jimi-data")),
            other => panic!("expected text message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_is_deregistered_on_next_publish() {
        let registry = SubscriberRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.attach(tx).await;
        registry.authenticate(id).await;
        drop(rx);

        registry.publish(&sample_fix()).await;
        assert_eq!(registry.len().await, 0);
    }
}
