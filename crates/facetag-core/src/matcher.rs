//! Identity matching: mean score per enrolled name with a rejection threshold.

use crate::gallery::Gallery;
use crate::metric::{DistanceMetric, MetricError};
use crate::types::{Embedding, MatchResult};

/// Classifies a query embedding against a gallery.
///
/// Each name's score is the arithmetic mean of the metric over all of that
/// name's reference embeddings, so every enrolled photo counts equally.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMatcher {
    metric: DistanceMetric,
    threshold: f32,
}

impl IdentityMatcher {
    /// Fails with [`MetricError::InvalidThreshold`] if `threshold` is not finite.
    pub fn new(metric: DistanceMetric, threshold: f32) -> Result<Self, MetricError> {
        if !threshold.is_finite() {
            return Err(MetricError::InvalidThreshold(threshold));
        }
        Ok(Self { metric, threshold })
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Pick the best-scoring name and accept it only if it clears the threshold.
    ///
    /// An empty gallery yields "Unknown". Ties keep the name that was
    /// enrolled first.
    pub fn classify(&self, query: &Embedding, gallery: &Gallery) -> Result<MatchResult, MetricError> {
        let mut best: Option<(&str, f32)> = None;

        for (name, group) in gallery.grouped_by_name() {
            let mut sum = 0.0f32;
            for embedding in &group {
                sum += self.metric.score(query.as_slice(), embedding.as_slice())?;
            }
            let mean = sum / group.len() as f32;

            let is_better = match best {
                None => !mean.is_nan(),
                Some((_, incumbent)) => self.metric.is_better(mean, incumbent),
            };
            if is_better {
                best = Some((name, mean));
            }
        }

        let result = match best {
            Some((name, score)) if self.metric.accepts(score, self.threshold) => MatchResult {
                label: name.to_string(),
                score,
                accepted: true,
            },
            Some((_, score)) => MatchResult::unknown(score),
            None => MatchResult::unknown(self.metric.worst_score()),
        };

        tracing::trace!(
            label = %result.label,
            score = result.score,
            accepted = result.accepted,
            metric = %self.metric,
            "classified embedding"
        );

        Ok(result)
    }
}
