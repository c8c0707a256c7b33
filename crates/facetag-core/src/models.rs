//! Embedding model presets and their calibrated thresholds.

use crate::metric::DistanceMetric;

/// A supported embedding model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPreset {
    pub name: &'static str,
    /// ONNX file name inside the model directory.
    pub file_name: &'static str,
    /// Square input side in pixels.
    pub input_size: u32,
    /// Embedding length.
    pub dimension: usize,
    pub cosine_threshold: f32,
    /// Calibrated for raw (unnormalized) embeddings.
    pub l2_threshold: f32,
}

impl ModelPreset {
    pub fn threshold(&self, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => self.cosine_threshold,
            DistanceMetric::L2 => self.l2_threshold,
        }
    }
}

pub const FACENET: ModelPreset = ModelPreset {
    name: "facenet",
    file_name: "facenet.onnx",
    input_size: 160,
    dimension: 128,
    cosine_threshold: 0.4,
    l2_threshold: 10.0,
};

pub const FACENET_512: ModelPreset = ModelPreset {
    name: "facenet-512",
    file_name: "facenet_512.onnx",
    input_size: 160,
    dimension: 512,
    cosine_threshold: 0.3,
    l2_threshold: 23.56,
};

pub const PRESETS: [ModelPreset; 2] = [FACENET, FACENET_512];

/// Look up a preset by name, case-insensitively.
pub fn by_name(name: &str) -> Option<ModelPreset> {
    PRESETS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
        .copied()
}
