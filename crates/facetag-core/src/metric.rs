//! Distance metrics over face embeddings.
//!
//! Embeddings are compared raw: neither metric normalizes its inputs, so
//! L2 thresholds are calibrated against the model's unnormalized output.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("unknown distance metric: {0} (expected \"cosine\" or \"l2\")")]
    UnknownMetric(String),
    #[error("threshold must be finite, got {0}")]
    InvalidThreshold(f32),
}

/// Metric used to score a query against gallery embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    Cosine,
    /// Euclidean distance. Lower = more similar.
    L2,
}

impl DistanceMetric {
    /// Score `a` against `b` with this metric.
    pub fn score(self, a: &[f32], b: &[f32]) -> Result<f32, MetricError> {
        match self {
            DistanceMetric::Cosine => cosine_similarity(a, b),
            DistanceMetric::L2 => euclidean_distance(a, b),
        }
    }

    /// True if `candidate` is strictly better than `incumbent`.
    ///
    /// NaN is never better than anything.
    pub fn is_better(self, candidate: f32, incumbent: f32) -> bool {
        match self {
            DistanceMetric::Cosine => candidate > incumbent,
            DistanceMetric::L2 => candidate < incumbent,
        }
    }

    /// True if `score` clears `threshold` for a positive identification.
    ///
    /// Cosine accepts when the similarity exceeds the threshold; L2 accepts
    /// only when the distance is below it.
    pub fn accepts(self, score: f32, threshold: f32) -> bool {
        match self {
            DistanceMetric::Cosine => score > threshold,
            DistanceMetric::L2 => score < threshold,
        }
    }

    /// Score reported when there is nothing to compare against.
    pub fn worst_score(self) -> f32 {
        match self {
            DistanceMetric::Cosine => 0.0,
            DistanceMetric::L2 => f32::INFINITY,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => f.write_str("cosine"),
            DistanceMetric::L2 => f.write_str("l2"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            other => Err(MetricError::UnknownMetric(other.to_string())),
        }
    }
}

fn check_dims(a: &[f32], b: &[f32]) -> Result<(), MetricError> {
    if a.len() != b.len() {
        return Err(MetricError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

/// Cosine similarity between two equal-length vectors.
///
/// Returns 0.0 if either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, MetricError> {
    check_dims(a, b)?;

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    Ok(if denom > 0.0 { dot / denom } else { 0.0 })
}

/// Euclidean distance between two equal-length vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, MetricError> {
    check_dims(a, b)?;

    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}
