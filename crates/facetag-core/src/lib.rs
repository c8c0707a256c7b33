//! facetag-core: identify faces against an enrolled gallery.
//!
//! Matches face embeddings against a gallery of (name, embedding) pairs
//! using cosine similarity or L2 distance, gates live frames so only one
//! classification is in flight, and builds galleries from labelled
//! reference photos in parallel.

pub mod admission;
pub mod collaborators;
pub mod embedder;
pub mod enrollment;
pub mod gallery;
pub mod matcher;
pub mod metric;
pub mod models;
pub mod types;

pub use admission::{Admission, FrameAdmissionController, FrameProcessor, FrameReport};
pub use collaborators::{
    crop_face, BoxError, FaceAttributeClassifier, FaceDetector, FaceEmbedder, FullFrameDetector,
    RegionError,
};
pub use embedder::{EmbedderError, OnnxEmbedder};
pub use enrollment::{Enrollment, EnrollmentImageError, EnrollmentPipeline, DEFAULT_ENROLL_WORKERS};
pub use gallery::{Gallery, GalleryError, GalleryStore, StoredGallery};
pub use matcher::IdentityMatcher;
pub use metric::{DistanceMetric, MetricError};
pub use models::ModelPreset;
pub use types::{BoundingBox, Embedding, GalleryEntry, MatchResult, Prediction, UNKNOWN_LABEL};

/// Default directory for model files: `$XDG_DATA_HOME/facetag/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    data_dir().join("models")
}

/// Default location of the persisted gallery.
pub fn default_gallery_path() -> std::path::PathBuf {
    data_dir().join("gallery.json")
}

fn data_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("facetag")
}
