// =============================================================================
// Signal Throttle — per-resource emission limits
// =============================================================================
//
// Two independent rules, both enforced per resource:
//   - Count:  at most `max_signals_per_window` signals per fixed window.
//   - Gap:    at least `min_gap` between two consecutive signals.
//
// Checking and recording are separate: a slot is consumed only by
// `record_at`, once the signal has actually been emitted. A denied check
// increments the resource's overflow counter and the global total; the
// returned `ThrottleOverflow` is forwarded to alerting.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ThrottleConfig;

/// Rule that denied a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleRule {
    MinGap,
    WindowFull,
}

/// Alert payload for a denied signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleOverflow {
    pub resource_id: String,
    pub window_start: DateTime<Utc>,
    pub rule: ThrottleRule,
    pub signal_count: u32,
    pub overflow_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleVerdict {
    Allowed,
    Denied(ThrottleOverflow),
}

impl ThrottleVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Counter state of one resource.
#[derive(Debug, Clone)]
pub struct ThrottleWindow {
    pub resource_id: String,
    pub window_start: Instant,
    pub window_start_utc: DateTime<Utc>,
    pub signal_count: u32,
    pub last_signal_at: Option<Instant>,
    pub overflow_count: u64,
}

impl ThrottleWindow {
    fn new(resource_id: &str, now: Instant) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            window_start: now,
            window_start_utc: Utc::now(),
            signal_count: 0,
            last_signal_at: None,
            overflow_count: 0,
        }
    }
}

/// Serialisable per-resource throttle counters.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleSnapshot {
    pub resource_id: String,
    pub window_start: DateTime<Utc>,
    pub signal_count: u32,
    pub overflow_count: u64,
}

#[derive(Debug)]
pub struct SignalThrottle {
    windows: DashMap<String, ThrottleWindow>,
    window: Duration,
    max_signals: u32,
    min_gap: Duration,
    total_overflows: AtomicU64,
}

impl SignalThrottle {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            windows: DashMap::new(),
            window: config.window(),
            max_signals: config.max_signals_per_window,
            min_gap: config.min_gap(),
            total_overflows: AtomicU64::new(0),
        }
    }

    /// `true` if the resource may emit a signal now; consumes a slot.
    pub fn allow(&self, resource_id: &str) -> bool {
        self.allow_at(resource_id, Instant::now())
    }

    pub fn allow_at(&self, resource_id: &str, now: Instant) -> bool {
        let allowed = self.check_at(resource_id, now).is_allowed();
        if allowed {
            self.record_at(resource_id, now);
        }
        allowed
    }

    pub fn check(&self, resource_id: &str) -> ThrottleVerdict {
        self.check_at(resource_id, Instant::now())
    }

    /// Evaluate both rules without consuming a slot. A denial is counted as
    /// an overflow.
    pub fn check_at(&self, resource_id: &str, now: Instant) -> ThrottleVerdict {
        let mut w = self.window_at(resource_id, now);

        let rule = match w.last_signal_at {
            Some(last) if now.saturating_duration_since(last) < self.min_gap => {
                Some(ThrottleRule::MinGap)
            }
            _ if w.signal_count >= self.max_signals => Some(ThrottleRule::WindowFull),
            _ => None,
        };

        let Some(rule) = rule else {
            return ThrottleVerdict::Allowed;
        };

        w.overflow_count += 1;
        self.total_overflows.fetch_add(1, Ordering::Relaxed);
        warn!(
            resource_id,
            rule = ?rule,
            signal_count = w.signal_count,
            overflow_count = w.overflow_count,
            "signal throttled"
        );
        ThrottleVerdict::Denied(ThrottleOverflow {
            resource_id: resource_id.to_string(),
            window_start: w.window_start_utc,
            rule,
            signal_count: w.signal_count,
            overflow_count: w.overflow_count,
        })
    }

    /// Consume a slot for a signal that was actually emitted.
    pub fn record_at(&self, resource_id: &str, now: Instant) {
        let mut w = self.window_at(resource_id, now);
        w.signal_count += 1;
        w.last_signal_at = Some(now);
        debug!(
            resource_id,
            signal_count = w.signal_count,
            max = self.max_signals,
            "signal recorded by throttle"
        );
    }

    /// Window of `resource_id`, rolled over if it has elapsed.
    fn window_at(&self, resource_id: &str, now: Instant) -> RefMut<'_, String, ThrottleWindow> {
        let mut w = self
            .windows
            .entry(resource_id.to_string())
            .or_insert_with(|| ThrottleWindow::new(resource_id, now));

        if now.saturating_duration_since(w.window_start) >= self.window {
            w.window_start = now;
            w.window_start_utc = Utc::now();
            w.signal_count = 0;
        }
        w
    }

    pub fn overflow_count(&self, resource_id: &str) -> u64 {
        self.windows
            .get(resource_id)
            .map(|w| w.overflow_count)
            .unwrap_or(0)
    }

    pub fn total_overflows(&self) -> u64 {
        self.total_overflows.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<ThrottleSnapshot> {
        let mut out: Vec<ThrottleSnapshot> = self
            .windows
            .iter()
            .map(|w| ThrottleSnapshot {
                resource_id: w.resource_id.clone(),
                window_start: w.window_start_utc,
                signal_count: w.signal_count,
                overflow_count: w.overflow_count,
            })
            .collect();
        out.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        out
    }
}
