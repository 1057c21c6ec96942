// =============================================================================
// Calibration — confluence multiplier table and score interpretation bands
// =============================================================================
//
// win_rate = clamp(base_rate(pattern) × confluence_multiplier(signal_count))
// score    = win_rate × 100
//
// The multiplier table rises monotonically and saturates at seven signals, so
// a single pattern can never reach an extreme score on its own.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Multiplier for 1, 2, … 7+ corroborating patterns.
const CONFLUENCE_MULTIPLIERS: [f64; 7] = [1.00, 1.15, 1.28, 1.38, 1.46, 1.51, 1.55];

/// Upper bound of [`confluence_multiplier`].
pub const MAX_CONFLUENCE_MULTIPLIER: f64 = 1.55;

/// Multiplier applied to a base rate when `signal_count` distinct patterns
/// agree. Zero signals is treated as one.
pub fn confluence_multiplier(signal_count: usize) -> f64 {
    let idx = signal_count.clamp(1, CONFLUENCE_MULTIPLIERS.len()) - 1;
    CONFLUENCE_MULTIPLIERS[idx]
}

/// Calibrated win rate, clamped to [0, 1].
pub fn calibrated_win_rate(base_rate: f64, signal_count: usize) -> f64 {
    (base_rate * confluence_multiplier(signal_count)).clamp(0.0, 1.0)
}

/// Map a win rate (0-1) to a 0-100 score.
pub fn score_from_win_rate(win_rate: f64) -> f64 {
    (win_rate.clamp(0.0, 1.0) * 100.0).clamp(0.0, 100.0)
}

/// Fixed interpretation band of a 0-100 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBand {
    Avoid,
    Weak,
    Moderate,
    Rare,
    VeryRare,
    Exceptional,
}

impl ScoreBand {
    pub fn from_score(score: f64) -> Self {
        if score >= 95.0 {
            Self::Exceptional
        } else if score >= 90.0 {
            Self::VeryRare
        } else if score >= 80.0 {
            Self::Rare
        } else if score >= 70.0 {
            Self::Moderate
        } else if score >= 60.0 {
            Self::Weak
        } else {
            Self::Avoid
        }
    }

    /// Approximate share of evaluations landing in this band.
    pub fn expected_frequency(self) -> &'static str {
        match self {
            Self::Exceptional => "<1%",
            Self::VeryRare => "1-3%",
            Self::Rare => "3-10%",
            Self::Moderate => "10-25%",
            Self::Weak => "25-40%",
            Self::Avoid => ">40%",
        }
    }

    pub fn is_tradeable(self) -> bool {
        self >= Self::Rare
    }
}

impl std::fmt::Display for ScoreBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exceptional => write!(f, "exceptional"),
            Self::VeryRare => write!(f, "very rare"),
            Self::Rare => write!(f, "rare/tradeable"),
            Self::Moderate => write!(f, "moderate"),
            Self::Weak => write!(f, "weak"),
            Self::Avoid => write!(f, "avoid"),
        }
    }
}
