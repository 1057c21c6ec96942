// =============================================================================
// Signal Aggregator — confluence of calibrated scores per resource
// =============================================================================
//
// Pipeline for one ConfluenceSet:
//   1. Drop scores below `min_confidence`.
//   2. Nothing left → rejected (insufficient_data).
//   3. Combine the remaining win rates with the pluggable strategy
//      (confidence-weighted mean by default).
//   4. Rare event: raw ≥ rare_win_rate, or a rare pattern flagged by at least
//      `rare_min_sources` sources. The boost applies only in the second case
//      and only once, before the threshold check.
//   5. Circuit breaker: emergency rejects, caution raises the threshold,
//      warning is logged only.
//   6. Threshold check, then direction consensus.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AggregatorConfig;
use crate::risk_guard::BreakerLevel;
use crate::scoring::ComponentScore;
use crate::types::{Decision, Direction, RejectionReason};

// ---------------------------------------------------------------------------
// ConfluenceSet
// ---------------------------------------------------------------------------

/// Scores for one resource collected within the confluence window.
#[derive(Debug, Clone, Default)]
pub struct ConfluenceSet {
    resource_id: String,
    scores: Vec<ComponentScore>,
}

impl ConfluenceSet {
    pub fn new(resource_id: impl Into<String>, scores: Vec<ComponentScore>) -> Self {
        Self {
            resource_id: resource_id.into(),
            scores,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn scores(&self) -> &[ComponentScore] {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// The weight a single score carried into the combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreContribution {
    pub component_id: String,
    pub win_rate: f64,
    pub confidence: f64,
    pub weight: f64,
    pub direction: Direction,
}

impl ScoreContribution {
    /// Effective weight: configured component weight × confidence.
    pub fn effective_weight(&self) -> f64 {
        self.weight * self.confidence
    }
}

/// Terminal verdict on one ConfluenceSet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSignal {
    pub resource_id: String,
    /// Win rate after any rare-event boost.
    pub combined_win_rate: f64,
    /// Win rate before the boost.
    pub raw_win_rate: f64,
    pub direction: Direction,
    pub confluence_count: u32,
    pub rare_event: bool,
    pub boost_applied: bool,
    /// Threshold in force, including any caution margin.
    pub effective_threshold: f64,
    pub breaker_level: BreakerLevel,
    pub decided_at: DateTime<Utc>,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<RejectionReason>,
    #[serde(default)]
    pub contributions: Vec<ScoreContribution>,
}

impl AggregatedSignal {
    pub fn is_approved(&self) -> bool {
        self.decision == Decision::Approved
    }
}

// ---------------------------------------------------------------------------
// Combination strategy
// ---------------------------------------------------------------------------

/// Blending formula for the retained scores.
pub trait CombinationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Combined win rate, or `None` when the inputs carry no weight.
    fn combine(&self, contributions: &[ScoreContribution]) -> Option<f64>;
}

/// Σ(weight × confidence × win_rate) / Σ(weight × confidence).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceWeightedMean;

impl CombinationStrategy for ConfidenceWeightedMean {
    fn name(&self) -> &'static str {
        "confidence_weighted_mean"
    }

    fn combine(&self, contributions: &[ScoreContribution]) -> Option<f64> {
        let total: f64 = contributions.iter().map(|c| c.effective_weight()).sum();
        if total <= 0.0 {
            return None;
        }
        let weighted: f64 = contributions
            .iter()
            .map(|c| c.effective_weight() * c.win_rate)
            .sum();
        Some((weighted / total).clamp(0.0, 1.0))
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct SignalAggregator {
    config: AggregatorConfig,
    strategy: Box<dyn CombinationStrategy>,
}

impl SignalAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self::with_strategy(config, Box::new(ConfidenceWeightedMean))
    }

    pub fn with_strategy(config: AggregatorConfig, strategy: Box<dyn CombinationStrategy>) -> Self {
        Self { config, strategy }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn evaluate(&self, set: &ConfluenceSet, breaker: BreakerLevel) -> AggregatedSignal {
        self.evaluate_at(set, breaker, Utc::now())
    }

    /// Decide a ConfluenceSet under the given circuit breaker level.
    pub fn evaluate_at(
        &self,
        set: &ConfluenceSet,
        breaker: BreakerLevel,
        decided_at: DateTime<Utc>,
    ) -> AggregatedSignal {
        let cfg = &self.config;
        let resource_id = set.resource_id();

        // ── 1. Confidence filter ─────────────────────────────────────────
        let retained: Vec<&ComponentScore> = set
            .scores()
            .iter()
            .filter(|s| s.confidence >= cfg.min_confidence && s.is_usable())
            .collect();

        let contributions: Vec<ScoreContribution> = retained
            .iter()
            .map(|s| ScoreContribution {
                component_id: s.component_id.clone(),
                win_rate: s.win_rate,
                confidence: s.confidence,
                weight: cfg.weight_of(&s.component_id),
                direction: s.direction,
            })
            .collect();

        let mut signal = AggregatedSignal {
            resource_id: resource_id.to_string(),
            combined_win_rate: 0.0,
            raw_win_rate: 0.0,
            direction: Direction::Neutral,
            confluence_count: retained.len() as u32,
            rare_event: false,
            boost_applied: false,
            effective_threshold: self.threshold_for(breaker),
            breaker_level: breaker,
            decided_at,
            decision: Decision::Rejected,
            rejection_reason: None,
            contributions: Vec::new(),
        };

        // ── 2 & 3. Combine ───────────────────────────────────────────────
        let raw = match self.strategy.combine(&contributions) {
            Some(raw) if !retained.is_empty() => raw,
            _ => {
                debug!(
                    resource_id,
                    offered = set.len(),
                    min_confidence = cfg.min_confidence,
                    "no usable scores"
                );
                return Self::reject(signal, RejectionReason::InsufficientData);
            }
        };
        signal.raw_win_rate = raw;
        signal.direction = consensus_direction(&contributions);

        // ── 4. Rare event & boost ────────────────────────────────────────
        let mut combined = raw;
        if raw >= cfg.rare_win_rate {
            signal.rare_event = true;
        } else if let Some(pattern) = self.corroborated_rare_pattern(&retained) {
            signal.rare_event = true;
            signal.boost_applied = true;
            combined = (raw * (1.0 + cfg.rare_boost)).min(1.0);
            debug!(
                resource_id,
                pattern = %pattern,
                raw,
                boosted = combined,
                "rare pattern corroborated — boost applied"
            );
        }
        signal.combined_win_rate = combined;
        signal.contributions = contributions;

        // ── 5. Circuit breaker ───────────────────────────────────────────
        if breaker.is_suspended() {
            return Self::reject(signal, RejectionReason::RiskSuspended);
        }
        match breaker {
            BreakerLevel::Caution => {
                debug!(
                    resource_id,
                    threshold = signal.effective_threshold,
                    "caution — raised qualification threshold"
                );
            }
            BreakerLevel::Warning => {
                info!(resource_id, combined, "evaluating under circuit breaker warning");
            }
            BreakerLevel::Closed | BreakerLevel::Emergency => {}
        }

        // ── 6. Threshold & consensus ─────────────────────────────────────
        if combined < signal.effective_threshold {
            return Self::reject(signal, RejectionReason::BelowThreshold);
        }
        if signal.direction == Direction::Neutral {
            return Self::reject(signal, RejectionReason::NoConsensus);
        }

        signal.decision = Decision::Approved;
        info!(
            resource_id,
            combined_win_rate = signal.combined_win_rate,
            direction = %signal.direction,
            confluence = signal.confluence_count,
            rare_event = signal.rare_event,
            strategy = self.strategy.name(),
            "signal approved"
        );
        signal
    }

    /// Qualification threshold under a breaker level.
    pub fn threshold_for(&self, breaker: BreakerLevel) -> f64 {
        let base = self.config.qualification_threshold;
        match breaker {
            BreakerLevel::Caution => (base + self.config.caution_margin).min(1.0),
            _ => base,
        }
    }

    /// First rare pattern (alphabetically) flagged by enough distinct sources.
    fn corroborated_rare_pattern(&self, retained: &[&ComponentScore]) -> Option<String> {
        let mut sources: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for score in retained {
            for pattern in &score.rare_patterns {
                sources
                    .entry(pattern.as_str())
                    .or_default()
                    .insert(score.component_id.as_str());
            }
        }
        let min_sources = self.config.rare_min_sources.max(1);
        sources
            .into_iter()
            .find(|(_, comps)| comps.len() >= min_sources)
            .map(|(pattern, _)| pattern.to_string())
    }

    fn reject(mut signal: AggregatedSignal, reason: RejectionReason) -> AggregatedSignal {
        signal.decision = Decision::Rejected;
        signal.rejection_reason = Some(reason);
        debug!(
            resource_id = %signal.resource_id,
            reason = %reason,
            combined_win_rate = signal.combined_win_rate,
            threshold = signal.effective_threshold,
            "signal rejected"
        );
        signal
    }
}

impl std::fmt::Debug for SignalAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalAggregator")
            .field("strategy", &self.strategy.name())
            .field("config", &self.config)
            .finish()
    }
}

/// Weighted vote of directions; ties resolve to neutral.
fn consensus_direction(contributions: &[ScoreContribution]) -> Direction {
    let vote: f64 = contributions
        .iter()
        .map(|c| c.effective_weight() * c.direction.sign())
        .sum();
    if vote > f64::EPSILON {
        Direction::Long
    } else if vote < -f64::EPSILON {
        Direction::Short
    } else {
        Direction::Neutral
    }
}
