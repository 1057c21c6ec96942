// =============================================================================
// Shared types used across the confluence core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction implied by a score or an aggregated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// +1.0 for long, -1.0 for short, 0.0 for neutral.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
            Self::Neutral => 0.0,
        }
    }

    pub fn is_directional(self) -> bool {
        !matches!(self, Self::Neutral)
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
            Self::Neutral => Self::Neutral,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Liquidity class of a vault, and the preference of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityTier {
    High,
    Medium,
    Low,
}

impl Default for LiquidityTier {
    fn default() -> Self {
        Self::High
    }
}

impl std::fmt::Display for LiquidityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Terminal decision of an aggregated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Reason code attached to every rejected signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InsufficientData,
    BelowThreshold,
    RiskSuspended,
    NoConsensus,
    Throttled,
    Busy,
    NoCapacity,
    AlreadyAllocated,
    Quarantined,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientData => "insufficient_data",
            Self::BelowThreshold => "below_threshold",
            Self::RiskSuspended => "risk_suspended",
            Self::NoConsensus => "no_consensus",
            Self::Throttled => "throttled",
            Self::Busy => "busy",
            Self::NoCapacity => "no_capacity",
            Self::AlreadyAllocated => "already_allocated",
            Self::Quarantined => "quarantined",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reason_serialises_snake_case() {
        let json = serde_json::to_string(&RejectionReason::BelowThreshold).unwrap();
        assert_eq!(json, "\"below_threshold\"");
        assert_eq!(RejectionReason::InsufficientData.to_string(), "insufficient_data");
    }

    #[test]
    fn direction_sign_matches_variant() {
        assert_eq!(Direction::Long.sign(), 1.0);
        assert_eq!(Direction::Short.sign(), -1.0);
        assert!(!Direction::Neutral.is_directional());
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Neutral.opposite(), Direction::Neutral);
    }
}
