use serde::{Deserialize, Serialize};

/// Label returned when no gallery identity clears the acceptance threshold.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Face region in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    /// True if the box has positive area and lies fully inside a
    /// `width` × `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.left.is_finite()
            && self.top.is_finite()
            && self.width > 0.0
            && self.height > 0.0
            && self.left >= 0.0
            && self.top >= 0.0
            && self.right() <= width as f32
            && self.bottom() <= height as f32
    }
}

/// Face embedding vector produced by the configured model (128-d for FaceNet,
/// 512-d for FaceNet-512).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// One enrolled reference photo. Several entries may share a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
}

impl GalleryEntry {
    pub fn new(name: impl Into<String>, embedding: impl Into<Embedding>) -> Self {
        Self {
            name: name.into(),
            embedding: embedding.into(),
        }
    }
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Best-matching name, or [`UNKNOWN_LABEL`] when rejected.
    pub label: String,
    /// Aggregate (mean) score of the best name group.
    pub score: f32,
    pub accepted: bool,
}

impl MatchResult {
    pub fn unknown(score: f32) -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            score,
            accepted: false,
        }
    }
}

/// Per-face output handed to the display layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// Box in the source frame's coordinate space.
    pub bbox: BoundingBox,
    pub label: String,
    pub score: f32,
    /// Optional extra attribute label, e.g. mask status.
    pub secondary: Option<String>,
}
