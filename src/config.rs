// =============================================================================
// Engine Configuration — every tunable of the confluence core, with atomic save
// =============================================================================
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file. Durations are stored as whole seconds.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::LiquidityTier;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_resources() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
    ]
}

fn default_confluence_window_secs() -> u64 {
    300
}

fn default_cycle_interval_secs() -> u64 {
    5
}

fn default_min_observations() -> usize {
    1
}

fn default_weight() -> f64 {
    1.0
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_qualification_threshold() -> f64 {
    0.80
}

fn default_rare_win_rate() -> f64 {
    0.90
}

fn default_rare_min_sources() -> usize {
    2
}

fn default_rare_boost() -> f64 {
    0.15
}

fn default_caution_margin() -> f64 {
    0.05
}

fn default_warning_threshold() -> f64 {
    0.50
}

fn default_caution_threshold() -> f64 {
    0.70
}

fn default_emergency_threshold() -> f64 {
    0.90
}

fn default_consecutive_warnings() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_lock_ttl_secs() -> u64 {
    30
}

/// Longest lock TTL `validate` accepts (one day).
pub const MAX_LOCK_TTL_SECS: u64 = 86_400;

fn default_throttle_window_secs() -> u64 {
    3600
}

fn default_max_signals_per_window() -> u32 {
    3
}

fn default_min_gap_secs() -> u64 {
    300
}

fn default_vault_capacity() -> usize {
    2
}

fn default_vaults() -> Vec<VaultSpec> {
    vec![
        VaultSpec::new("vault-a", LiquidityTier::High),
        VaultSpec::new("vault-b", LiquidityTier::High),
        VaultSpec::new("vault-c", LiquidityTier::Medium),
        VaultSpec::new("vault-d", LiquidityTier::Low),
    ]
}

fn default_resource_tiers() -> HashMap<String, LiquidityTier> {
    let mut tiers = HashMap::new();
    tiers.insert("BNBUSDT".to_string(), LiquidityTier::Medium);
    tiers.insert("XRPUSDT".to_string(), LiquidityTier::Low);
    tiers
}

fn default_scorers() -> Vec<ScorerConfig> {
    vec![
        ScorerConfig {
            component_id: "order_flow".to_string(),
            min_observations: 1,
            patterns: vec![
                PatternSpec::new("absorption", 0.62, false),
                PatternSpec::new("cvd_divergence", 0.58, false),
                PatternSpec::new("iceberg_refill", 0.66, true),
                PatternSpec::new("sweep_reclaim", 0.64, false),
            ],
        },
        ScorerConfig {
            component_id: "momentum".to_string(),
            min_observations: 1,
            patterns: vec![
                PatternSpec::new("ema_stack", 0.57, false),
                PatternSpec::new("rsi_reversal", 0.55, false),
                PatternSpec::new("volatility_squeeze", 0.63, true),
            ],
        },
        ScorerConfig {
            component_id: "liquidation_map".to_string(),
            min_observations: 1,
            patterns: vec![
                PatternSpec::new("cluster_magnet", 0.60, false),
                PatternSpec::new("cascade_exhaustion", 0.68, true),
                PatternSpec::new("iceberg_refill", 0.61, true),
            ],
        },
    ]
}

// =============================================================================
// Scorer catalog
// =============================================================================

/// Calibrated base rate of one pattern within one information source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    pub name: String,
    /// Historical win rate of the pattern on its own (0-1).
    pub base_rate: f64,
    /// Statistically uncommon pattern; two sources agreeing on it mark a rare
    /// event.
    #[serde(default)]
    pub rare: bool,
}

impl PatternSpec {
    pub fn new(name: impl Into<String>, base_rate: f64, rare: bool) -> Self {
        Self {
            name: name.into(),
            base_rate,
            rare,
        }
    }
}

/// One information source and its pattern catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub component_id: String,
    /// Fewer known observations than this yields a zero-confidence score.
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    #[serde(default)]
    pub patterns: Vec<PatternSpec>,
}

// =============================================================================
// Aggregator
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Scores below this confidence are discarded before combining.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Combined win rate required for approval.
    #[serde(default = "default_qualification_threshold")]
    pub qualification_threshold: f64,

    /// Combined win rate at or above which a signal is a rare event.
    #[serde(default = "default_rare_win_rate")]
    pub rare_win_rate: f64,

    /// Number of distinct sources that must flag the same rare pattern.
    #[serde(default = "default_rare_min_sources")]
    pub rare_min_sources: usize,

    /// Multiplicative boost for rare events below `rare_win_rate`
    /// (0.15 = +15 %). Must lie in [0.15, 0.30].
    #[serde(default = "default_rare_boost")]
    pub rare_boost: f64,

    /// Threshold increase while the circuit breaker is in `caution`.
    #[serde(default = "default_caution_margin")]
    pub caution_margin: f64,

    /// Per-component weight. Missing components weigh 1.0.
    #[serde(default)]
    pub component_weights: HashMap<String, f64>,
}

impl AggregatorConfig {
    pub fn weight_of(&self, component_id: &str) -> f64 {
        self.component_weights
            .get(component_id)
            .copied()
            .unwrap_or_else(default_weight)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            qualification_threshold: default_qualification_threshold(),
            rare_win_rate: default_rare_win_rate(),
            rare_min_sources: default_rare_min_sources(),
            rare_boost: default_rare_boost(),
            caution_margin: default_caution_margin(),
            component_weights: HashMap::new(),
        }
    }
}

// =============================================================================
// Risk guard
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskGuardConfig {
    /// T1: closed -> warning when the metric exceeds this.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// T2: warning -> caution.
    #[serde(default = "default_caution_threshold")]
    pub caution_threshold: f64,

    /// T3: caution -> emergency.
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f64,

    /// Consecutive over-T1 readings in `warning` that escalate to `caution`.
    #[serde(default = "default_consecutive_warnings")]
    pub consecutive_warnings: u32,

    /// How long the metric must stay at or below T1 before `emergency`
    /// resets itself.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl RiskGuardConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for RiskGuardConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
            caution_threshold: default_caution_threshold(),
            emergency_threshold: default_emergency_threshold(),
            consecutive_warnings: default_consecutive_warnings(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

// =============================================================================
// Locks & throttle
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_throttle_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_max_signals_per_window")]
    pub max_signals_per_window: u32,

    /// Minimum spacing between two signals of the same resource.
    #[serde(default = "default_min_gap_secs")]
    pub min_gap_secs: u64,
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn min_gap(&self) -> Duration {
        Duration::from_secs(self.min_gap_secs)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_secs: default_throttle_window_secs(),
            max_signals_per_window: default_max_signals_per_window(),
            min_gap_secs: default_min_gap_secs(),
        }
    }
}

// =============================================================================
// Vaults
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSpec {
    pub vault_id: String,
    #[serde(default = "default_vault_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub liquidity_tier: LiquidityTier,
}

impl VaultSpec {
    pub fn new(vault_id: impl Into<String>, liquidity_tier: LiquidityTier) -> Self {
        Self {
            vault_id: vault_id.into(),
            capacity: default_vault_capacity(),
            liquidity_tier,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vaults")]
    pub vaults: Vec<VaultSpec>,

    /// Preferred liquidity tier per resource.
    #[serde(default = "default_resource_tiers")]
    pub resource_tiers: HashMap<String, LiquidityTier>,

    /// Tier used for resources missing from `resource_tiers`.
    #[serde(default)]
    pub default_tier: LiquidityTier,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            vaults: default_vaults(),
            resource_tiers: default_resource_tiers(),
            default_tier: LiquidityTier::High,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration of the confluence core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Resources evaluated every cycle.
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,

    /// Scores older than this are left out of a ConfluenceSet.
    #[serde(default = "default_confluence_window_secs")]
    pub confluence_window_secs: u64,

    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    #[serde(default = "default_scorers")]
    pub scorers: Vec<ScorerConfig>,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub risk_guard: RiskGuardConfig,

    #[serde(default)]
    pub locks: LockConfig,

    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub vaults: VaultConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resources: default_resources(),
            confluence_window_secs: default_confluence_window_secs(),
            cycle_interval_secs: default_cycle_interval_secs(),
            scorers: default_scorers(),
            aggregator: AggregatorConfig::default(),
            risk_guard: RiskGuardConfig::default(),
            locks: LockConfig::default(),
            throttle: ThrottleConfig::default(),
            vaults: VaultConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn confluence_window(&self) -> Duration {
        Duration::from_secs(self.confluence_window_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }

    /// Load configuration from a JSON file at `path` and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid engine config in {}", path.display()))?;

        info!(
            path = %path.display(),
            resources = ?config.resources,
            vaults = config.vaults.vaults.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Reject settings the components cannot operate under.
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregator;
        for (name, v) in [
            ("min_confidence", agg.min_confidence),
            ("qualification_threshold", agg.qualification_threshold),
            ("rare_win_rate", agg.rare_win_rate),
        ] {
            ensure!((0.0..=1.0).contains(&v), "aggregator.{name} must be in [0, 1], got {v}");
        }
        ensure!(
            (0.15..=0.30).contains(&agg.rare_boost),
            "aggregator.rare_boost must be in [0.15, 0.30], got {}",
            agg.rare_boost
        );
        ensure!(agg.caution_margin >= 0.0, "aggregator.caution_margin must be >= 0");
        ensure!(
            agg.component_weights.values().all(|w| *w >= 0.0),
            "aggregator.component_weights must be non-negative"
        );

        let rg = &self.risk_guard;
        ensure!(
            rg.warning_threshold < rg.caution_threshold
                && rg.caution_threshold < rg.emergency_threshold,
            "risk_guard thresholds must satisfy T1 < T2 < T3"
        );
        ensure!(rg.consecutive_warnings > 0, "risk_guard.consecutive_warnings must be > 0");

        ensure!(
            (1..=MAX_LOCK_TTL_SECS).contains(&self.locks.ttl_secs),
            "locks.ttl_secs must be in [1, {MAX_LOCK_TTL_SECS}], got {}",
            self.locks.ttl_secs
        );
        ensure!(
            self.throttle.max_signals_per_window > 0,
            "throttle.max_signals_per_window must be > 0"
        );

        ensure!(!self.vaults.vaults.is_empty(), "at least one vault is required");
        let mut seen = HashSet::new();
        for v in &self.vaults.vaults {
            ensure!(v.capacity > 0, "vault {} must have capacity > 0", v.vault_id);
            ensure!(seen.insert(v.vault_id.as_str()), "duplicate vault_id {}", v.vault_id);
        }

        for s in &self.scorers {
            for p in &s.patterns {
                ensure!(
                    (0.0..=1.0).contains(&p.base_rate),
                    "scorer {} pattern {} base_rate must be in [0, 1]",
                    s.component_id,
                    p.name
                );
            }
        }

        Ok(())
    }
}
