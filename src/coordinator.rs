// =============================================================================
// Orchestration Coordinator — one gated evaluation cycle per resource
// =============================================================================
//
// Gate order for a resource:
//
//   quarantine → ConfluenceSet → Aggregator (risk-aware) → Throttle
//     → Lock acquire → Throttle re-check → Vault allocate → Lock release → event
//
// The first failing gate ends the cycle with a RejectedSignal. Busy locks are
// never waited on. The throttle slot is recorded only once the vault has
// accepted the signal, under the resource lock; a signal refused by the lock
// or the vault leaves the resource's emission budget untouched. A lock taken in a cycle is released on every path before
// the cycle returns, so a rejected cycle leaves nothing held.
//
// An invariant violation quarantines the resource: later cycles are rejected
// with `quarantined` until an operator calls `clear_quarantine`.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregatedSignal, SignalAggregator};
use crate::config::EngineConfig;
use crate::errors::{AllocationError, InvariantViolation};
use crate::events::{
    AllocationEvent, ApprovedAllocation, EventSink, InvariantAlert, RejectedSignal,
};
use crate::lock_manager::{LockInfo, LockManager, ResourceLock};
use crate::risk_guard::{CircuitBreakerState, CircuitBreakerTransition, RiskGuard};
use crate::scoring::{ComponentScore, ComponentScorer, Observation, ScoreBoard};
use crate::throttle::{SignalThrottle, ThrottleSnapshot, ThrottleVerdict};
use crate::types::RejectionReason;
use crate::vault::{Vault, VaultAllocator, VaultAssignment};

/// Terminal result of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Approved(ApprovedAllocation),
    Rejected(RejectedSignal),
    Halted(InvariantAlert),
}

impl CycleOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved(_))
    }

    pub fn resource_id(&self) -> &str {
        match self {
            Self::Approved(a) => &a.resource_id,
            Self::Rejected(r) => &r.resource_id,
            Self::Halted(h) => &h.resource_id,
        }
    }

    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            Self::Rejected(r) => Some(r.reason),
            _ => None,
        }
    }

    fn to_event(&self) -> AllocationEvent {
        match self {
            Self::Approved(a) => AllocationEvent::Approved(a.clone()),
            Self::Rejected(r) => AllocationEvent::Rejected(r.clone()),
            Self::Halted(h) => AllocationEvent::InvariantViolation(h.clone()),
        }
    }
}

/// Serialisable operational view of the whole core.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorSnapshot {
    pub taken_at: DateTime<Utc>,
    pub cycles_run: u64,
    pub risk: CircuitBreakerState,
    pub held_locks: Vec<LockInfo>,
    pub vaults: Vec<Vault>,
    pub throttle: Vec<ThrottleSnapshot>,
    pub total_throttle_overflows: u64,
    pub quarantined: Vec<InvariantAlert>,
}

/// Why a cycle stopped short of approval.
enum Gate {
    Reject(RejectionReason),
    Halt(InvariantViolation),
}

impl From<AllocationError> for Gate {
    fn from(e: AllocationError) -> Self {
        Gate::Reject(e.rejection_reason())
    }
}

pub struct Orchestrator {
    config: EngineConfig,
    worker_id: String,
    board: ScoreBoard,
    aggregator: SignalAggregator,
    risk_guard: Arc<RiskGuard>,
    throttle: SignalThrottle,
    locks: LockManager,
    vaults: VaultAllocator,
    sink: Arc<dyn EventSink>,
    quarantine: DashMap<String, InvariantAlert>,
    cycles: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        let aggregator = SignalAggregator::new(config.aggregator.clone());
        Self::with_aggregator(config, aggregator, sink)
    }

    /// Build with a custom aggregator (e.g. a different combination strategy).
    pub fn with_aggregator(
        config: EngineConfig,
        aggregator: SignalAggregator,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let worker_id = format!("orchestrator-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        info!(
            worker_id = %worker_id,
            resources = config.resources.len(),
            strategy = aggregator.strategy_name(),
            "Orchestrator initialised"
        );

        Self {
            board: ScoreBoard::new(),
            risk_guard: Arc::new(RiskGuard::new(config.risk_guard.clone())),
            throttle: SignalThrottle::new(&config.throttle),
            locks: LockManager::new(config.locks.ttl()),
            vaults: VaultAllocator::new(&config.vaults),
            quarantine: DashMap::new(),
            cycles: AtomicU64::new(0),
            aggregator,
            worker_id,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn board(&self) -> &ScoreBoard {
        &self.board
    }

    pub fn risk_guard(&self) -> &Arc<RiskGuard> {
        &self.risk_guard
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn vaults(&self) -> &VaultAllocator {
        &self.vaults
    }

    pub fn throttle(&self) -> &SignalThrottle {
        &self.throttle
    }

    // -------------------------------------------------------------------------
    // Inbound feeds
    // -------------------------------------------------------------------------

    /// Run a scorer over raw observations and keep its score for the next
    /// cycle. Scores without usable input are excluded.
    pub fn ingest(
        &self,
        scorer: &dyn ComponentScorer,
        resource_id: &str,
        observations: &[Observation],
    ) -> ComponentScore {
        let score = scorer.ingest(resource_id, observations);
        self.record_score(score.clone());
        score
    }

    pub fn record_score(&self, score: ComponentScore) {
        if !score.is_usable() {
            debug!(
                resource_id = %score.resource_id,
                component = %score.component_id,
                reason = %RejectionReason::InsufficientData,
                "score excluded from cycle"
            );
            return;
        }
        self.board.record(score);
    }

    /// Risk metric for this cycle. Any transition is published.
    pub fn update_metric(&self, value: f64) -> Option<CircuitBreakerTransition> {
        self.publish_transition(self.risk_guard.update_metric(value))
    }

    pub fn report_stop_loss_breach(&self) -> Option<CircuitBreakerTransition> {
        self.publish_transition(self.risk_guard.report_stop_loss_breach())
    }

    pub fn manual_reset(&self) -> Option<CircuitBreakerTransition> {
        self.publish_transition(self.risk_guard.manual_reset())
    }

    fn publish_transition(
        &self,
        transition: Option<CircuitBreakerTransition>,
    ) -> Option<CircuitBreakerTransition> {
        if let Some(t) = &transition {
            self.sink.publish(AllocationEvent::CircuitBreaker(t.clone()));
        }
        transition
    }

    /// Position-closed notification from execution.
    pub fn position_closed(&self, vault_id: &str, resource_id: &str) -> Result<bool, AllocationError> {
        self.vaults.release(vault_id, resource_id)
    }

    pub fn purge_expired_locks(&self) -> usize {
        self.locks.purge_expired()
    }

    // -------------------------------------------------------------------------
    // Quarantine
    // -------------------------------------------------------------------------

    pub fn is_quarantined(&self, resource_id: &str) -> bool {
        self.quarantine.contains_key(resource_id)
    }

    /// Operator acknowledgement of an invariant violation.
    pub fn clear_quarantine(&self, resource_id: &str) -> bool {
        let cleared = self.quarantine.remove(resource_id).is_some();
        if cleared {
            warn!(resource_id, "quarantine cleared by operator");
        }
        cleared
    }

    fn halt(&self, resource_id: &str, violation: InvariantViolation, at: DateTime<Utc>) -> InvariantAlert {
        let alert = InvariantAlert {
            resource_id: resource_id.to_string(),
            violation,
            detected_at: at,
        };
        self.quarantine.insert(resource_id.to_string(), alert.clone());

        let snapshot = serde_json::to_string(&self.snapshot())
            .unwrap_or_else(|e| format!("<snapshot unavailable: {e}>"));
        error!(
            resource_id,
            violation = %alert.violation,
            snapshot = %snapshot,
            "INVARIANT VIOLATION — resource quarantined"
        );
        alert
    }

    // -------------------------------------------------------------------------
    // Cycles
    // -------------------------------------------------------------------------

    pub fn run_cycle(&self, resource_id: &str) -> CycleOutcome {
        self.run_cycle_at(resource_id, Utc::now(), Instant::now())
    }

    /// One evaluation cycle for `resource_id`; the outcome is also published.
    pub fn run_cycle_at(&self, resource_id: &str, decided_at: DateTime<Utc>, now: Instant) -> CycleOutcome {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;

        let outcome = match self.gate(resource_id, cycle, decided_at, now) {
            Ok(approved) => CycleOutcome::Approved(approved),
            Err(Gate::Reject(reason)) => CycleOutcome::Rejected(RejectedSignal {
                resource_id: resource_id.to_string(),
                reason,
                decided_at,
            }),
            Err(Gate::Halt(violation)) => {
                CycleOutcome::Halted(self.halt(resource_id, violation, decided_at))
            }
        };

        self.sink.publish(outcome.to_event());
        outcome
    }

    fn gate(
        &self,
        resource_id: &str,
        cycle: u64,
        decided_at: DateTime<Utc>,
        now: Instant,
    ) -> Result<ApprovedAllocation, Gate> {
        // ── 1. Quarantine ────────────────────────────────────────────────
        if self.is_quarantined(resource_id) {
            // Drop the pending scores so they do not pile up while halted.
            self.board
                .take_confluence_set(resource_id, decided_at, self.config.confluence_window());
            debug!(resource_id, "cycle skipped — resource quarantined");
            return Err(Gate::Reject(RejectionReason::Quarantined));
        }

        // ── 2. Aggregate under the current breaker level ─────────────────
        let set = self
            .board
            .take_confluence_set(resource_id, decided_at, self.config.confluence_window());
        let breaker = self.risk_guard.level();
        let signal = self.aggregator.evaluate_at(&set, breaker, decided_at);
        if !signal.is_approved() {
            let reason = signal
                .rejection_reason
                .unwrap_or(RejectionReason::BelowThreshold);
            debug!(
                resource_id,
                reason = %reason,
                combined_win_rate = signal.combined_win_rate,
                scores = set.len(),
                "signal rejected by aggregator"
            );
            return Err(Gate::Reject(reason));
        }

        // ── 3. Throttle ──────────────────────────────────────────────────
        self.throttle_gate(resource_id, now)?;

        // ── 4. Lock ──────────────────────────────────────────────────────
        let holder = format!("{}#{}", self.worker_id, cycle);
        let lock = match self
            .locks
            .try_acquire_at(resource_id, &holder, self.locks.default_ttl(), now)
        {
            Ok(lock) => lock,
            Err(busy) => {
                info!(
                    resource_id,
                    holder = %busy.holder_id,
                    expires_in_ms = busy.expires_in.as_millis() as u64,
                    "resource busy — retry next cycle"
                );
                return Err(Gate::Reject(RejectionReason::Busy));
            }
        };

        // ── 5. Re-check, allocate and record while holding the lock ──────
        let placed = self.allocate_locked(&lock, &signal, now);
        self.locks.release(&lock);
        let assignment = placed?;

        info!(
            resource_id,
            vault_id = %assignment.vault_id,
            combined_win_rate = signal.combined_win_rate,
            direction = %signal.direction,
            confluence = signal.confluence_count,
            rare = signal.rare_event,
            breaker = %breaker,
            "signal APPROVED and allocated"
        );

        Ok(ApprovedAllocation {
            resource_id: resource_id.to_string(),
            vault_id: assignment.vault_id,
            combined_win_rate: signal.combined_win_rate,
            direction: signal.direction,
            decided_at,
        })
    }

    fn throttle_gate(&self, resource_id: &str, now: Instant) -> Result<(), Gate> {
        match self.throttle.check_at(resource_id, now) {
            ThrottleVerdict::Allowed => Ok(()),
            ThrottleVerdict::Denied(overflow) => {
                self.sink.publish(AllocationEvent::ThrottleOverflow(overflow));
                Err(Gate::Reject(RejectionReason::Throttled))
            }
        }
    }

    fn allocate_locked(
        &self,
        lock: &ResourceLock,
        signal: &AggregatedSignal,
        now: Instant,
    ) -> Result<VaultAssignment, Gate> {
        if !self.locks.is_held_by(lock, now) {
            return Err(Gate::Halt(InvariantViolation::LockDoubleGranted {
                resource_id: lock.resource_id.clone(),
                expected_holder: lock.holder_id.clone(),
                actual_holder: self
                    .locks
                    .holder_at(&lock.resource_id, now)
                    .map(|l| l.holder_id),
            }));
        }

        // Another cycle may have emitted between the first check and the grant.
        self.throttle_gate(&lock.resource_id, now)?;

        let assignment = match self.vaults.allocate(signal) {
            Ok(a) => a,
            Err(e) => {
                info!(resource_id = %signal.resource_id, error = %e, "allocation refused");
                return Err(e.into());
            }
        };

        self.vaults
            .verify(&assignment.vault_id)
            .map_err(Gate::Halt)?;
        self.throttle.record_at(&lock.resource_id, now);
        Ok(assignment)
    }

    /// Run one cycle for every resource concurrently.
    pub async fn run_all(self: &Arc<Self>, resources: &[String]) -> Vec<CycleOutcome> {
        let tasks = resources.iter().cloned().map(|resource_id| {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_cycle(&resource_id) })
        });

        join_all(tasks)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(error = %e, "evaluation task failed");
                    None
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        let mut quarantined: Vec<InvariantAlert> =
            self.quarantine.iter().map(|e| e.value().clone()).collect();
        quarantined.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));

        OrchestratorSnapshot {
            taken_at: Utc::now(),
            cycles_run: self.cycles.load(Ordering::Relaxed),
            risk: self.risk_guard.current_state(),
            held_locks: self.locks.lock_infos(),
            vaults: self.vaults.snapshot(),
            throttle: self.throttle.snapshot(),
            total_throttle_overflows: self.throttle.total_overflows(),
            quarantined,
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("worker_id", &self.worker_id)
            .field("resources", &self.config.resources)
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .field("quarantined", &self.quarantine.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VaultConfig, VaultSpec};
    use crate::events::EventLog;
    use crate::risk_guard::BreakerLevel;
    use crate::types::{Direction, LiquidityTier};
    use std::sync::Barrier;
    use std::time::Duration;

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.throttle.min_gap_secs = 300;
        cfg
    }

    fn orchestrator(cfg: EngineConfig) -> (Orchestrator, Arc<EventLog>) {
        let log = Arc::new(EventLog::default());
        (Orchestrator::new(cfg, log.clone()), log)
    }

    fn feed(orch: &Orchestrator, resource: &str, scores: &[(f64, f64)]) {
        for (i, (win_rate, confidence)) in scores.iter().enumerate() {
            orch.record_score(ComponentScore::new(
                format!("source-{i}"),
                resource,
                *win_rate,
                *confidence,
                Direction::Long,
                2,
                Utc::now(),
            ));
        }
    }

    #[test]
    fn weak_confluence_is_rejected_below_threshold() {
        let (orch, log) = orchestrator(config());
        feed(&orch, "BTCUSDT", &[(0.70, 0.9), (0.85, 0.8)]);

        let outcome = orch.run_cycle("BTCUSDT");
        assert_eq!(outcome.rejection_reason(), Some(RejectionReason::BelowThreshold));
        assert!(orch.locks().held_locks().is_empty());
        assert!(orch.vaults().placement_of("BTCUSDT").is_none());
        assert_eq!(log.rejections().len(), 1);
        // Scores are consumed by the decision.
        assert_eq!(orch.board().pending("BTCUSDT"), 0);
    }

    #[test]
    fn strong_confluence_is_allocated_and_lock_released() {
        let (orch, log) = orchestrator(config());
        feed(&orch, "BTCUSDT", &[(0.88, 0.9), (0.87, 0.9), (0.86, 0.85)]);

        let outcome = orch.run_cycle("BTCUSDT");
        match &outcome {
            CycleOutcome::Approved(a) => {
                assert_eq!(a.vault_id, "vault-a");
                assert_eq!(a.direction, Direction::Long);
                assert!(a.combined_win_rate >= 0.86);
            }
            other => panic!("expected approval, got {other:?}"),
        }
        assert!(orch.locks().held_locks().is_empty());
        assert_eq!(orch.vaults().placement_of("BTCUSDT").as_deref(), Some("vault-a"));
        assert_eq!(log.approvals().len(), 1);
    }

    #[test]
    fn busy_lock_rejects_without_allocating() {
        let (orch, _log) = orchestrator(config());
        let other = orch
            .locks()
            .try_acquire("ETHUSDT", "other-agent", Duration::from_secs(30))
            .unwrap();
        feed(&orch, "ETHUSDT", &[(0.9, 0.9), (0.9, 0.9)]);

        let outcome = orch.run_cycle("ETHUSDT");
        assert_eq!(outcome.rejection_reason(), Some(RejectionReason::Busy));
        assert!(orch.vaults().placement_of("ETHUSDT").is_none());
        assert_eq!(orch.locks().held_locks()[0].holder_id, "other-agent");

        // The busy cycle emitted nothing, so the retry is not throttled.
        assert!(orch.locks().release(&other));
        feed(&orch, "ETHUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
        assert!(orch.run_cycle("ETHUSDT").is_approved());
    }

    #[test]
    fn emergency_suspends_every_signal() {
        let (orch, log) = orchestrator(config());
        // One level per reading: closed → warning → caution → emergency.
        let levels: Vec<BreakerLevel> = (0..3)
            .filter_map(|_| orch.update_metric(0.95))
            .map(|t| t.to_state)
            .collect();
        assert_eq!(
            levels,
            vec![BreakerLevel::Warning, BreakerLevel::Caution, BreakerLevel::Emergency]
        );

        feed(&orch, "BTCUSDT", &[(0.95, 0.95), (0.95, 0.95)]);
        let outcome = orch.run_cycle("BTCUSDT");
        assert_eq!(outcome.rejection_reason(), Some(RejectionReason::RiskSuspended));
        assert!(log
            .recent()
            .iter()
            .any(|e| matches!(e, AllocationEvent::CircuitBreaker(_))));

        orch.manual_reset().unwrap();
        assert_eq!(orch.risk_guard().level(), BreakerLevel::Closed);
    }

    #[test]
    fn second_signal_inside_gap_is_throttled() {
        let (orch, log) = orchestrator(config());
        let t0 = Instant::now();
        feed(&orch, "SOLUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
        assert!(orch.run_cycle_at("SOLUSDT", Utc::now(), t0).is_approved());

        feed(&orch, "SOLUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
        let outcome = orch.run_cycle_at("SOLUSDT", Utc::now(), t0 + Duration::from_secs(10));
        assert_eq!(outcome.rejection_reason(), Some(RejectionReason::Throttled));
        assert!(log
            .recent()
            .iter()
            .any(|e| matches!(e, AllocationEvent::ThrottleOverflow(_))));
        assert_eq!(orch.throttle().total_overflows(), 1);
    }

    #[test]
    fn full_tier_drops_signal_and_closed_position_frees_slot() {
        let mut cfg = config();
        cfg.throttle.min_gap_secs = 0;
        cfg.vaults = VaultConfig {
            vaults: vec![VaultSpec::new("vault-low", LiquidityTier::Low).with_capacity(1)],
            resource_tiers: Default::default(),
            default_tier: LiquidityTier::Low,
        };
        let (orch, _log) = orchestrator(cfg);

        feed(&orch, "AAA", &[(0.9, 0.9), (0.9, 0.9)]);
        assert!(orch.run_cycle("AAA").is_approved());

        feed(&orch, "BBB", &[(0.9, 0.9), (0.9, 0.9)]);
        let outcome = orch.run_cycle("BBB");
        assert_eq!(outcome.rejection_reason(), Some(RejectionReason::NoCapacity));
        assert!(orch.locks().held_locks().is_empty());

        assert!(orch.position_closed("vault-low", "AAA").unwrap());
        feed(&orch, "BBB", &[(0.9, 0.9), (0.9, 0.9)]);
        assert!(orch.run_cycle("BBB").is_approved());
    }

    #[test]
    fn refused_allocation_leaves_throttle_budget_intact() {
        let mut cfg = config();
        cfg.vaults = VaultConfig {
            vaults: vec![VaultSpec::new("vault-low", LiquidityTier::Low).with_capacity(1)],
            resource_tiers: Default::default(),
            default_tier: LiquidityTier::Low,
        };
        let (orch, _log) = orchestrator(cfg);
        let t0 = Instant::now();

        feed(&orch, "AAA", &[(0.9, 0.9), (0.9, 0.9)]);
        assert!(orch.run_cycle_at("AAA", Utc::now(), t0).is_approved());

        feed(&orch, "BBB", &[(0.9, 0.9), (0.9, 0.9)]);
        assert_eq!(
            orch.run_cycle_at("BBB", Utc::now(), t0).rejection_reason(),
            Some(RejectionReason::NoCapacity)
        );
        assert_eq!(orch.throttle().overflow_count("BBB"), 0);

        assert!(orch.position_closed("vault-low", "AAA").unwrap());
        feed(&orch, "BBB", &[(0.9, 0.9), (0.9, 0.9)]);
        let outcome = orch.run_cycle_at("BBB", Utc::now(), t0 + Duration::from_secs(10));
        assert!(outcome.is_approved(), "got {outcome:?}");
        assert_eq!(orch.throttle().total_overflows(), 0);
    }

    #[test]
    fn overlapping_cycles_on_one_resource_place_it_once() {
        let (orch, _log) = orchestrator(config());
        let workers = 16;
        let barrier = Barrier::new(workers);
        let now = Instant::now();

        let outcomes: Vec<CycleOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        feed(&orch, "BTCUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
                        orch.run_cycle_at("BTCUSDT", Utc::now(), now)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(outcomes.iter().filter(|o| o.is_approved()).count(), 1);
        assert!(!outcomes.iter().any(|o| matches!(o, CycleOutcome::Halted(_))));
        for outcome in outcomes.iter().filter(|o| !o.is_approved()) {
            assert!(
                matches!(
                    outcome.rejection_reason(),
                    Some(
                        RejectionReason::InsufficientData
                            | RejectionReason::Busy
                            | RejectionReason::Throttled
                            | RejectionReason::AlreadyAllocated
                    )
                ),
                "unexpected outcome {outcome:?}"
            );
        }

        assert_eq!(orch.vaults().placement_of("BTCUSDT").as_deref(), Some("vault-a"));
        let placed: usize = orch.vaults().snapshot().iter().map(|v| v.occupants.len()).sum();
        assert_eq!(placed, 1);
        assert!(orch.vaults().audit().is_empty());
        assert!(orch.locks().held_locks().is_empty());
        assert!(!orch.is_quarantined("BTCUSDT"));
    }

    #[test]
    fn oversized_lock_ttl_does_not_panic() {
        let mut cfg = config();
        cfg.locks.ttl_secs = u64::MAX;
        let (orch, _log) = orchestrator(cfg);

        feed(&orch, "BTCUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
        assert!(orch.run_cycle("BTCUSDT").is_approved());
        assert!(orch.locks().held_locks().is_empty());
        assert_eq!(orch.purge_expired_locks(), 0);
    }

    #[test]
    fn occupied_resource_is_not_allocated_twice() {
        let mut cfg = config();
        cfg.throttle.min_gap_secs = 0;
        let (orch, _log) = orchestrator(cfg);

        feed(&orch, "BTCUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
        assert!(orch.run_cycle("BTCUSDT").is_approved());
        feed(&orch, "BTCUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
        assert_eq!(
            orch.run_cycle("BTCUSDT").rejection_reason(),
            Some(RejectionReason::AlreadyAllocated)
        );
    }

    #[test]
    fn expired_grant_quarantines_resource_until_cleared() {
        // A zero TTL makes the grant expire before allocation: the cycle no
        // longer owns the resource when it checks.
        let mut cfg = config();
        cfg.locks.ttl_secs = 0;
        let (orch, log) = orchestrator(cfg);

        feed(&orch, "BTCUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
        match orch.run_cycle("BTCUSDT") {
            CycleOutcome::Halted(alert) => assert!(matches!(
                alert.violation,
                InvariantViolation::LockDoubleGranted { .. }
            )),
            other => panic!("expected halt, got {other:?}"),
        }
        assert!(orch.is_quarantined("BTCUSDT"));
        assert!(orch.vaults().placement_of("BTCUSDT").is_none());
        assert_eq!(orch.snapshot().quarantined.len(), 1);

        feed(&orch, "BTCUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
        assert_eq!(
            orch.run_cycle("BTCUSDT").rejection_reason(),
            Some(RejectionReason::Quarantined)
        );
        assert_eq!(orch.board().pending("BTCUSDT"), 0);
        assert!(log
            .recent()
            .iter()
            .any(|e| matches!(e, AllocationEvent::InvariantViolation(_))));

        assert!(orch.clear_quarantine("BTCUSDT"));
        assert!(!orch.is_quarantined("BTCUSDT"));
    }

    #[test]
    fn snapshot_serialises() {
        let (orch, _log) = orchestrator(config());
        feed(&orch, "BTCUSDT", &[(0.9, 0.9), (0.9, 0.9)]);
        orch.run_cycle("BTCUSDT");

        let json = serde_json::to_value(orch.snapshot()).unwrap();
        assert_eq!(json["cycles_run"], 1);
        assert_eq!(json["risk"]["level"], "closed");
        assert_eq!(json["vaults"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn run_all_fans_out_across_resources() {
        let (orch, log) = orchestrator(config());
        let orch = Arc::new(orch);
        let resources: Vec<String> = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for r in &resources {
            feed(&orch, r, &[(0.9, 0.9), (0.88, 0.9), (0.87, 0.85)]);
        }

        let outcomes = orch.run_all(&resources).await;
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(CycleOutcome::is_approved));
        assert_eq!(log.approvals().len(), 4);
        assert!(orch.vaults().audit().is_empty());
        assert_eq!(orch.vaults().placement_of("BNBUSDT").as_deref(), Some("vault-c"));
        assert!(orch.locks().held_locks().is_empty());
    }
}
