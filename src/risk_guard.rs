// =============================================================================
// Risk Guard — four-level circuit breaker driven by an external risk metric
// =============================================================================
//
// Levels:
//   closed    — signals flow normally.
//   warning   — logged, not blocked.
//   caution   — the aggregator raises its qualification threshold.
//   emergency — every signal is rejected.
//
// Escalation moves one level per reading:
//   closed  → warning    metric > T1 (or latched stop-loss breach)
//   warning → caution    metric > T2, N consecutive readings > T1, or breach
//   caution → emergency  metric > T3, or breach
//
// Step-down also moves one level per reading (warning → closed at <= T1,
// caution → warning at <= T2) unless a stop-loss breach is latched.
// Emergency only leaves through a manual reset or after the metric has stayed
// at or below T1 for the whole cooldown; leaving emergency is the single
// multi-level jump. A manual reset below emergency steps down one level.
// =============================================================================

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RiskGuardConfig;

/// Maximum number of transitions retained for audit.
const MAX_TRANSITION_HISTORY: usize = 256;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerLevel {
    Closed,
    Warning,
    Caution,
    Emergency,
}

impl BreakerLevel {
    fn escalated(self) -> Self {
        match self {
            Self::Closed => Self::Warning,
            Self::Warning => Self::Caution,
            Self::Caution | Self::Emergency => Self::Emergency,
        }
    }

    pub fn is_suspended(self) -> bool {
        self == Self::Emergency
    }
}

impl Default for BreakerLevel {
    fn default() -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for BreakerLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Warning => write!(f, "warning"),
            Self::Caution => write!(f, "caution"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    MetricThreshold,
    ConsecutiveWarnings,
    StopLossBreach,
    Recovery,
    Cooldown,
    ManualReset,
}

/// Audit record of one level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerTransition {
    pub from_state: BreakerLevel,
    pub to_state: BreakerLevel,
    pub metric_value: f64,
    pub trigger: TransitionTrigger,
    pub timestamp: DateTime<Utc>,
}

/// Read-only snapshot handed to the aggregator and coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub level: BreakerLevel,
    pub metric: f64,
    pub last_transition_at: DateTime<Utc>,
    #[serde(default)]
    pub consecutive_warnings: u32,
    #[serde(default)]
    pub stop_loss_breached: bool,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    level: BreakerLevel,
    metric: f64,
    last_transition_at: DateTime<Utc>,
    consecutive_warnings: u32,
    stop_loss_breached: bool,
    /// First reading of the current at-or-below-T1 run while in emergency.
    calm_since: Option<Instant>,
    history: VecDeque<CircuitBreakerTransition>,
}

// ---------------------------------------------------------------------------
// Risk Guard
// ---------------------------------------------------------------------------

pub struct RiskGuard {
    state: RwLock<Inner>,
    config: RiskGuardConfig,
}

impl RiskGuard {
    pub fn new(config: RiskGuardConfig) -> Self {
        info!(
            t1 = config.warning_threshold,
            t2 = config.caution_threshold,
            t3 = config.emergency_threshold,
            consecutive_warnings = config.consecutive_warnings,
            cooldown_secs = config.cooldown_secs,
            "RiskGuard initialised"
        );

        Self {
            state: RwLock::new(Inner {
                level: BreakerLevel::Closed,
                metric: 0.0,
                last_transition_at: Utc::now(),
                consecutive_warnings: 0,
                stop_loss_breached: false,
                calm_since: None,
                history: VecDeque::new(),
            }),
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn current_state(&self) -> CircuitBreakerState {
        let s = self.state.read();
        CircuitBreakerState {
            level: s.level,
            metric: s.metric,
            last_transition_at: s.last_transition_at,
            consecutive_warnings: s.consecutive_warnings,
            stop_loss_breached: s.stop_loss_breached,
        }
    }

    pub fn level(&self) -> BreakerLevel {
        self.state.read().level
    }

    /// Transitions recorded so far, oldest first.
    pub fn history(&self) -> Vec<CircuitBreakerTransition> {
        self.state.read().history.iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Metric feed
    // -------------------------------------------------------------------------

    /// Feed the risk metric for this cycle. Returns the transition, if any.
    pub fn update_metric(&self, value: f64) -> Option<CircuitBreakerTransition> {
        self.update_metric_at(value, Instant::now())
    }

    pub fn update_metric_at(&self, value: f64, now: Instant) -> Option<CircuitBreakerTransition> {
        if !value.is_finite() {
            warn!(value, "non-finite risk metric ignored");
            return None;
        }

        let cfg = &self.config;
        let mut s = self.state.write();
        s.metric = value;

        let level = s.level;
        let next = match level {
            BreakerLevel::Closed => {
                if value > cfg.warning_threshold {
                    Some((BreakerLevel::Warning, TransitionTrigger::MetricThreshold))
                } else if s.stop_loss_breached {
                    Some((BreakerLevel::Warning, TransitionTrigger::StopLossBreach))
                } else {
                    None
                }
            }
            BreakerLevel::Warning => {
                if value > cfg.caution_threshold {
                    Some((BreakerLevel::Caution, TransitionTrigger::MetricThreshold))
                } else if s.stop_loss_breached {
                    Some((BreakerLevel::Caution, TransitionTrigger::StopLossBreach))
                } else if value > cfg.warning_threshold {
                    s.consecutive_warnings += 1;
                    if s.consecutive_warnings >= cfg.consecutive_warnings {
                        Some((BreakerLevel::Caution, TransitionTrigger::ConsecutiveWarnings))
                    } else {
                        None
                    }
                } else {
                    Some((BreakerLevel::Closed, TransitionTrigger::Recovery))
                }
            }
            BreakerLevel::Caution => {
                if value > cfg.emergency_threshold {
                    Some((BreakerLevel::Emergency, TransitionTrigger::MetricThreshold))
                } else if s.stop_loss_breached {
                    Some((BreakerLevel::Emergency, TransitionTrigger::StopLossBreach))
                } else if value <= cfg.caution_threshold {
                    Some((BreakerLevel::Warning, TransitionTrigger::Recovery))
                } else {
                    None
                }
            }
            BreakerLevel::Emergency => {
                if value <= cfg.warning_threshold {
                    let since = *s.calm_since.get_or_insert(now);
                    let calm_for = now.saturating_duration_since(since);
                    if calm_for >= cfg.cooldown() {
                        Some((BreakerLevel::Closed, TransitionTrigger::Cooldown))
                    } else {
                        debug!(
                            value,
                            calm_secs = calm_for.as_secs_f64(),
                            cooldown_secs = cfg.cooldown_secs,
                            "emergency cooling down"
                        );
                        None
                    }
                } else {
                    if s.calm_since.take().is_some() {
                        debug!(value, "emergency cooldown interrupted");
                    }
                    None
                }
            }
        };

        next.map(|(to, trigger)| self.transition(&mut s, to, trigger))
    }

    /// Record a hard stop-loss breach. The breach is latched until the guard
    /// returns to `closed`, and escalates one level now and on every later
    /// reading.
    pub fn report_stop_loss_breach(&self) -> Option<CircuitBreakerTransition> {
        let mut s = self.state.write();
        s.stop_loss_breached = true;
        s.calm_since = None;
        warn!(level = %s.level, "hard stop-loss breach reported");

        if s.level == BreakerLevel::Emergency {
            return None;
        }
        let to = s.level.escalated();
        Some(self.transition(&mut s, to, TransitionTrigger::StopLossBreach))
    }

    /// Operator reset. Emergency goes straight to `closed`; warning and
    /// caution step down one level, like an automatic recovery would.
    /// Always clears a latched stop-loss breach.
    pub fn manual_reset(&self) -> Option<CircuitBreakerTransition> {
        let mut s = self.state.write();
        s.stop_loss_breached = false;
        let to = match s.level {
            BreakerLevel::Closed => {
                info!("manual reset requested while already closed");
                return None;
            }
            BreakerLevel::Emergency | BreakerLevel::Warning => BreakerLevel::Closed,
            BreakerLevel::Caution => BreakerLevel::Warning,
        };
        Some(self.transition(&mut s, to, TransitionTrigger::ManualReset))
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn transition(
        &self,
        s: &mut Inner,
        to: BreakerLevel,
        trigger: TransitionTrigger,
    ) -> CircuitBreakerTransition {
        let from = s.level;
        let record = CircuitBreakerTransition {
            from_state: from,
            to_state: to,
            metric_value: s.metric,
            trigger,
            timestamp: Utc::now(),
        };

        s.level = to;
        s.last_transition_at = record.timestamp;
        s.calm_since = None;
        s.consecutive_warnings = match to {
            BreakerLevel::Warning if s.metric > self.config.warning_threshold => 1,
            _ => 0,
        };
        if to == BreakerLevel::Closed {
            s.stop_loss_breached = false;
        }

        s.history.push_back(record.clone());
        while s.history.len() > MAX_TRANSITION_HISTORY {
            s.history.pop_front();
        }

        warn!(
            from = %from,
            to = %to,
            metric = s.metric,
            trigger = ?trigger,
            "circuit breaker transition"
        );

        record
    }
}

impl std::fmt::Debug for RiskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RiskGuard")
            .field("level", &s.level)
            .field("metric", &s.metric)
            .field("warning_threshold", &self.config.warning_threshold)
            .field("caution_threshold", &self.config.caution_threshold)
            .field("emergency_threshold", &self.config.emergency_threshold)
            .finish()
    }
}
