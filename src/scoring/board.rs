// =============================================================================
// Score Board — latest ComponentScore per (component, resource)
// =============================================================================
//
// Scorers publish asynchronously; the coordinator takes everything a resource
// has accumulated when its cycle runs. Taking clears the resource, so each
// score feeds exactly one evaluation.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::aggregator::ConfluenceSet;
use crate::scoring::scorer::ComponentScore;

#[derive(Debug, Default)]
pub struct ScoreBoard {
    scores: DashMap<String, Vec<ComponentScore>>,
}

impl ScoreBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a score, replacing any earlier score from the same component
    /// for the same resource.
    pub fn record(&self, score: ComponentScore) {
        let mut entry = self.scores.entry(score.resource_id.clone()).or_default();
        entry.retain(|s| s.component_id != score.component_id);
        debug!(
            resource_id = %score.resource_id,
            component = %score.component_id,
            score = score.score,
            confidence = score.confidence,
            "score recorded"
        );
        entry.push(score);
    }

    /// Remove and return the scores of `resource_id` observed within `window`
    /// of `now`. Older scores are dropped.
    pub fn take_confluence_set(
        &self,
        resource_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> ConfluenceSet {
        let scores = self
            .scores
            .remove(resource_id)
            .map(|(_, v)| v)
            .unwrap_or_default();

        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let total = scores.len();
        let fresh: Vec<ComponentScore> = scores
            .into_iter()
            .filter(|s| s.observed_at >= cutoff)
            .collect();

        if fresh.len() < total {
            debug!(
                resource_id,
                stale = total - fresh.len(),
                "stale scores dropped from confluence set"
            );
        }

        ConfluenceSet::new(resource_id, fresh)
    }

    /// Number of scores waiting for `resource_id`.
    pub fn pending(&self, resource_id: &str) -> usize {
        self.scores.get(resource_id).map(|v| v.len()).unwrap_or(0)
    }
}
