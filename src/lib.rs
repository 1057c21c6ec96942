// =============================================================================
// Confluence Core — signal scoring and risk-gated allocation
// =============================================================================
//
// Independent scorers → aggregator (risk guard + throttle) → resource lock
// → vault allocator → outbound events.
// =============================================================================

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod lock_manager;
pub mod risk_guard;
pub mod scoring;
pub mod throttle;
pub mod types;
pub mod vault;

pub use aggregator::{AggregatedSignal, CombinationStrategy, ConfluenceSet, SignalAggregator};
pub use config::EngineConfig;
pub use coordinator::{CycleOutcome, Orchestrator, OrchestratorSnapshot};
pub use errors::{AllocationError, InvariantViolation, LockBusy};
pub use events::{AllocationEvent, ChannelSink, EventLog, EventSink};
pub use lock_manager::{LockManager, ResourceLock};
pub use risk_guard::{BreakerLevel, CircuitBreakerState, CircuitBreakerTransition, RiskGuard};
pub use scoring::{CalibratedScorer, ComponentScore, ComponentScorer, Observation};
pub use throttle::SignalThrottle;
pub use types::{Decision, Direction, LiquidityTier, RejectionReason};
pub use vault::{VaultAllocator, VaultAssignment};
