// =============================================================================
// Outbound events — what the core tells its collaborators
// =============================================================================
//
// Delivery is at-least-once; consumers deduplicate on `idempotency_key()`,
// which for decisions is `resource_id + decided_at`.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::InvariantViolation;
use crate::risk_guard::CircuitBreakerTransition;
use crate::throttle::ThrottleOverflow;
use crate::types::{Direction, RejectionReason};

/// Maximum number of events retained by `EventLog::default()`.
pub const MAX_RECENT_EVENTS: usize = 500;

/// Approved signal placed into a vault; consumed by order placement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovedAllocation {
    pub resource_id: String,
    pub vault_id: String,
    pub combined_win_rate: f64,
    pub direction: Direction,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedSignal {
    pub resource_id: String,
    pub reason: RejectionReason,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvariantAlert {
    pub resource_id: String,
    pub violation: InvariantViolation,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocationEvent {
    Approved(ApprovedAllocation),
    Rejected(RejectedSignal),
    CircuitBreaker(CircuitBreakerTransition),
    ThrottleOverflow(ThrottleOverflow),
    InvariantViolation(InvariantAlert),
}

impl AllocationEvent {
    /// Deduplication key for downstream consumers.
    pub fn idempotency_key(&self) -> String {
        match self {
            Self::Approved(a) => format!("{}:{}", a.resource_id, a.decided_at.to_rfc3339()),
            Self::Rejected(r) => format!("{}:{}", r.resource_id, r.decided_at.to_rfc3339()),
            Self::CircuitBreaker(t) => format!(
                "circuit_breaker:{}:{}->{}",
                t.timestamp.to_rfc3339(),
                t.from_state,
                t.to_state
            ),
            Self::ThrottleOverflow(o) => format!(
                "{}:throttle:{}:{}",
                o.resource_id,
                o.window_start.to_rfc3339(),
                o.overflow_count
            ),
            Self::InvariantViolation(v) => {
                format!("{}:invariant:{}", v.resource_id, v.detected_at.to_rfc3339())
            }
        }
    }

    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Self::Approved(a) => Some(&a.resource_id),
            Self::Rejected(r) => Some(&r.resource_id),
            Self::ThrottleOverflow(o) => Some(&o.resource_id),
            Self::InvariantViolation(v) => Some(&v.resource_id),
            Self::CircuitBreaker(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Approved(_) => "approved",
            Self::Rejected(_) => "rejected",
            Self::CircuitBreaker(_) => "circuit_breaker",
            Self::ThrottleOverflow(_) => "throttle_overflow",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receiver of outbound events. Publishing never blocks the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: AllocationEvent);
}

/// Bounded in-memory ring buffer of recent events.
#[derive(Debug)]
pub struct EventLog {
    events: RwLock<VecDeque<AllocationEvent>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<AllocationEvent> {
        self.events.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn approvals(&self) -> Vec<ApprovedAllocation> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                AllocationEvent::Approved(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn rejections(&self) -> Vec<RejectedSignal> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                AllocationEvent::Rejected(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(MAX_RECENT_EVENTS)
    }
}

impl EventSink for EventLog {
    fn publish(&self, event: AllocationEvent) {
        let mut events = self.events.write();
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }
}

/// Forwards events to an async consumer over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AllocationEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AllocationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: AllocationEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(kind = e.0.kind(), "event consumer gone — event dropped");
        }
    }
}

/// Publishes every event to each inner sink in order.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Fanout {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for Fanout {
    fn publish(&self, event: AllocationEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rejected(resource: &str, secs: i64) -> AllocationEvent {
        AllocationEvent::Rejected(RejectedSignal {
            resource_id: resource.to_string(),
            reason: RejectionReason::BelowThreshold,
            decided_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        })
    }

    #[test]
    fn idempotency_key_is_resource_and_decision_time() {
        let a = rejected("BTCUSDT", 0);
        let b = rejected("BTCUSDT", 0);
        let c = rejected("BTCUSDT", 1);
        assert_eq!(a.idempotency_key(), b.idempotency_key());
        assert_ne!(a.idempotency_key(), c.idempotency_key());
        assert!(a.idempotency_key().starts_with("BTCUSDT:"));
    }

    #[test]
    fn event_log_is_bounded() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.publish(rejected("ETHUSDT", i));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0], rejected("ETHUSDT", 2));
        assert_eq!(log.rejections().len(), 3);
        assert!(log.approvals().is_empty());
    }

    #[test]
    fn events_serialise_with_type_tag() {
        let json = serde_json::to_value(rejected("SOLUSDT", 0)).unwrap();
        assert_eq!(json["type"], "rejected");
        assert_eq!(json["reason"], "below_threshold");
    }

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish(rejected("A", 0));
        sink.publish(rejected("B", 0));
        assert_eq!(rx.recv().await.unwrap().resource_id(), Some("A"));
        assert_eq!(rx.recv().await.unwrap().resource_id(), Some("B"));

        drop(rx);
        // Publishing after the consumer is gone must not panic.
        sink.publish(rejected("C", 0));
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(EventLog::new(10));
        let b = Arc::new(EventLog::new(10));
        let fanout = Fanout::new(vec![
            a.clone() as Arc<dyn EventSink>,
            b.clone() as Arc<dyn EventSink>,
        ]);
        fanout.publish(rejected("A", 0));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
