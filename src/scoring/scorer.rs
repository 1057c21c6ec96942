// =============================================================================
// Calibrated Component Scorer — one information source → one ComponentScore
// =============================================================================
//
// Each source carries a catalog of patterns with calibrated base rates. For a
// batch of raw observations on one resource:
//   1. Unknown patterns are ignored.
//   2. The majority direction among directional observations wins.
//   3. Distinct patterns agreeing with that direction are the confluence
//      count; the strongest of them supplies the base rate.
//   4. Confidence is the agreement ratio of the winning direction.
//
// Too little data never fails: the score comes back with `confidence = 0` so
// the aggregator drops it like any other weak input.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{PatternSpec, ScorerConfig};
use crate::scoring::calibration::{calibrated_win_rate, score_from_win_rate, ScoreBand};
use crate::types::Direction;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// One raw observation from an information source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub pattern: String,
    pub direction: Direction,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(pattern: impl Into<String>, direction: Direction) -> Self {
        Self {
            pattern: pattern.into(),
            direction,
            observed_at: Utc::now(),
        }
    }
}

/// Calibrated output of one scorer for one resource in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub component_id: String,
    pub resource_id: String,
    /// 0-100, equal to `win_rate × 100`.
    pub score: f64,
    pub win_rate: f64,
    pub confidence: f64,
    pub direction: Direction,
    pub signal_count: u32,
    pub observed_at: DateTime<Utc>,
    /// Catalog patterns flagged rare that supported `direction`.
    #[serde(default)]
    pub rare_patterns: Vec<String>,
}

impl ComponentScore {
    /// Build a score from a win rate, deriving `score` from it.
    pub fn new(
        component_id: impl Into<String>,
        resource_id: impl Into<String>,
        win_rate: f64,
        confidence: f64,
        direction: Direction,
        signal_count: u32,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let win_rate = win_rate.clamp(0.0, 1.0);
        Self {
            component_id: component_id.into(),
            resource_id: resource_id.into(),
            score: score_from_win_rate(win_rate),
            win_rate,
            confidence: confidence.clamp(0.0, 1.0),
            direction,
            signal_count,
            observed_at,
            rare_patterns: Vec::new(),
        }
    }

    /// A score that carries no usable information.
    pub fn insufficient(
        component_id: impl Into<String>,
        resource_id: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            component_id,
            resource_id,
            0.0,
            0.0,
            Direction::Neutral,
            0,
            observed_at,
        )
    }

    pub fn with_rare_patterns(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.rare_patterns = patterns.into_iter().collect();
        self
    }

    pub fn band(&self) -> ScoreBand {
        ScoreBand::from_score(self.score)
    }

    pub fn is_usable(&self) -> bool {
        self.confidence > 0.0
    }
}

// ---------------------------------------------------------------------------
// Scorer trait
// ---------------------------------------------------------------------------

/// An information source that turns raw observations into a calibrated score.
pub trait ComponentScorer: Send + Sync {
    fn component_id(&self) -> &str;

    /// Score one resource at a given wall-clock time.
    fn ingest_at(
        &self,
        resource_id: &str,
        observations: &[Observation],
        now: DateTime<Utc>,
    ) -> ComponentScore;

    fn ingest(&self, resource_id: &str, observations: &[Observation]) -> ComponentScore {
        self.ingest_at(resource_id, observations, Utc::now())
    }
}

// ---------------------------------------------------------------------------
// Pattern catalog
// ---------------------------------------------------------------------------

/// Base rates and rarity flags of one source's patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternCatalog {
    patterns: HashMap<String, PatternSpec>,
}

impl PatternCatalog {
    pub fn new(patterns: impl IntoIterator<Item = PatternSpec>) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn get(&self, pattern: &str) -> Option<&PatternSpec> {
        self.patterns.get(pattern)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Calibrated scorer
// ---------------------------------------------------------------------------

pub struct CalibratedScorer {
    component_id: String,
    catalog: PatternCatalog,
    min_observations: usize,
}

impl CalibratedScorer {
    pub fn new(
        component_id: impl Into<String>,
        catalog: PatternCatalog,
        min_observations: usize,
    ) -> Self {
        let component_id = component_id.into();
        if catalog.is_empty() {
            warn!(component = %component_id, "empty pattern catalog — scorer will never be usable");
        } else {
            debug!(component = %component_id, patterns = catalog.len(), "scorer catalog loaded");
        }
        Self {
            component_id,
            catalog,
            min_observations: min_observations.max(1),
        }
    }

    pub fn from_config(cfg: &ScorerConfig) -> Self {
        Self::new(
            cfg.component_id.clone(),
            PatternCatalog::new(cfg.patterns.iter().cloned()),
            cfg.min_observations,
        )
    }
}

impl ComponentScorer for CalibratedScorer {
    fn component_id(&self) -> &str {
        &self.component_id
    }

    fn ingest_at(
        &self,
        resource_id: &str,
        observations: &[Observation],
        now: DateTime<Utc>,
    ) -> ComponentScore {
        let known: Vec<(&Observation, &PatternSpec)> = observations
            .iter()
            .filter_map(|o| self.catalog.get(&o.pattern).map(|spec| (o, spec)))
            .collect();

        if known.len() < self.min_observations {
            debug!(
                component = %self.component_id,
                resource_id,
                known = known.len(),
                required = self.min_observations,
                "insufficient observations — zero-confidence score"
            );
            return ComponentScore::insufficient(&self.component_id, resource_id, now);
        }

        let longs = known.iter().filter(|(o, _)| o.direction == Direction::Long).count();
        let shorts = known.iter().filter(|(o, _)| o.direction == Direction::Short).count();
        let directional = longs + shorts;

        let (direction, agreeing_votes) = if longs > shorts {
            (Direction::Long, longs)
        } else if shorts > longs {
            (Direction::Short, shorts)
        } else {
            (Direction::Neutral, 0)
        };

        if direction == Direction::Neutral {
            debug!(
                component = %self.component_id,
                resource_id,
                longs,
                shorts,
                "no directional majority — zero-confidence score"
            );
            return ComponentScore::insufficient(&self.component_id, resource_id, now);
        }

        let mut agreeing: BTreeSet<&str> = BTreeSet::new();
        let mut rare: BTreeSet<&str> = BTreeSet::new();
        let mut base_rate: f64 = 0.0;
        for (obs, spec) in &known {
            if obs.direction != direction {
                continue;
            }
            agreeing.insert(spec.name.as_str());
            if spec.rare {
                rare.insert(spec.name.as_str());
            }
            base_rate = base_rate.max(spec.base_rate);
        }

        let signal_count = agreeing.len();
        let win_rate = calibrated_win_rate(base_rate, signal_count);
        let confidence = agreeing_votes as f64 / directional as f64;

        let score = ComponentScore::new(
            &self.component_id,
            resource_id,
            win_rate,
            confidence,
            direction,
            signal_count as u32,
            now,
        )
        .with_rare_patterns(rare.into_iter().map(str::to_string));

        debug!(
            component = %self.component_id,
            resource_id,
            %direction,
            signal_count,
            base_rate,
            win_rate,
            confidence,
            band = %score.band(),
            "component score computed"
        );

        score
    }
}
