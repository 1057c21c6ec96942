// =============================================================================
// Scoring Module
// =============================================================================
//
// Per-source calibrated scoring:
// - Confluence multiplier table and interpretation bands
// - Pattern-catalog scorer producing ComponentScores
// - Score board collecting the latest score per (component, resource)

pub mod board;
pub mod calibration;
pub mod scorer;

pub use board::ScoreBoard;
pub use calibration::{calibrated_win_rate, confluence_multiplier, ScoreBand};
pub use scorer::{CalibratedScorer, ComponentScore, ComponentScorer, Observation, PatternCatalog};
