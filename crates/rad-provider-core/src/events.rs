use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::circuit::CircuitState;
use crate::health::ProviderHealth;

pub const CHANNEL_USAGE: &str = "usage:realtime";
pub const CHANNEL_HEALTH: &str = "provider:health";
pub const CHANNEL_CIRCUIT: &str = "provider:circuit";
pub const CHANNEL_ALERT: &str = "system:alert";

/// Aggregated usage over one wall-clock second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub window_start: i64,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub providers: Vec<ProviderHealth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub provider: String,
    pub from: CircuitState,
    pub to: CircuitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub severity: String,
    pub message: String,
    pub at: i64,
}

/// One event frame as delivered to admin subscribers:
/// `{"type": "<channel>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AdminEvent {
    #[serde(rename = "usage:realtime")]
    UsageRealtime(UsageWindow),
    #[serde(rename = "provider:health")]
    ProviderHealth(HealthSnapshot),
    #[serde(rename = "provider:circuit")]
    ProviderCircuit(CircuitTransition),
    #[serde(rename = "system:alert")]
    SystemAlert(SystemAlert),
}

impl AdminEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            AdminEvent::UsageRealtime(_) => CHANNEL_USAGE,
            AdminEvent::ProviderHealth(_) => CHANNEL_HEALTH,
            AdminEvent::ProviderCircuit(_) => CHANNEL_CIRCUIT,
            AdminEvent::SystemAlert(_) => CHANNEL_ALERT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event hub subscriber cap reached")]
pub struct HubFull;

/// Fan-out hub for admin dashboards. Delivery is per-subscriber bounded:
/// a slow subscriber loses its oldest queued events, never stalls producers.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    tx: broadcast::Sender<AdminEvent>,
    subscribers: AtomicUsize,
    max_subscribers: usize,
}

impl EventHub {
    pub fn new(buffer: usize, max_subscribers: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            inner: Arc::new(HubInner {
                tx,
                subscribers: AtomicUsize::new(0),
                max_subscribers,
            }),
        }
    }

    /// Best-effort broadcast; no subscribers is not an error.
    pub fn emit(&self, event: AdminEvent) {
        let _ = self.inner.tx.send(event);
    }

    pub fn subscribe(&self) -> Result<HubSubscription, HubFull> {
        let inner = &self.inner;
        inner
            .subscribers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < inner.max_subscribers).then_some(count + 1)
            })
            .map_err(|_| HubFull)?;
        Ok(HubSubscription {
            rx: inner.tx.subscribe(),
            dropped: AtomicU64::new(0),
            _slot: SlotGuard {
                inner: self.inner.clone(),
            },
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load(Ordering::Acquire)
    }
}

struct SlotGuard {
    inner: Arc<HubInner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.subscribers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One subscriber's view of the hub. Holds a slot until dropped.
pub struct HubSubscription {
    rx: broadcast::Receiver<AdminEvent>,
    dropped: AtomicU64,
    _slot: SlotGuard,
}

impl HubSubscription {
    /// Next event, skipping over anything this subscriber was too slow for.
    /// `None` once the hub shuts down.
    pub async fn recv(&mut self) -> Option<AdminEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    self.dropped.fetch_add(count, Ordering::Relaxed);
                    debug!(event = "admin_subscriber_lagged", dropped = count);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events lost to this subscriber's bounded queue so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(message: &str) -> AdminEvent {
        AdminEvent::SystemAlert(SystemAlert {
            severity: "info".to_string(),
            message: message.to_string(),
            at: 0,
        })
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_events() {
        let hub = EventHub::new(16, 10);
        let mut sub = hub.subscribe().unwrap();
        hub.emit(alert("one"));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.channel(), CHANNEL_ALERT);
    }

    #[tokio::test]
    async fn cap_rejects_excess_subscribers() {
        let hub = EventHub::new(16, 2);
        let first = hub.subscribe().unwrap();
        let _second = hub.subscribe().unwrap();
        assert!(hub.subscribe().is_err());
        drop(first);
        assert!(hub.subscribe().is_ok());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let hub = EventHub::new(2, 10);
        let mut sub = hub.subscribe().unwrap();
        for index in 0..5 {
            hub.emit(alert(&format!("m{index}")));
        }
        // Buffer of two: m3 and m4 survive, the rest were dropped.
        let AdminEvent::SystemAlert(first) = sub.recv().await.unwrap() else {
            panic!("unexpected event");
        };
        assert_eq!(first.message, "m3");
        assert_eq!(sub.dropped(), 3);
    }

    #[test]
    fn event_frame_shape_is_type_payload() {
        let json = serde_json::to_value(alert("boom")).unwrap();
        assert_eq!(json["type"], "system:alert");
        assert_eq!(json["payload"]["message"], "boom");
    }
}
