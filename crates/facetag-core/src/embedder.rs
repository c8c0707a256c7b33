//! FaceNet face embedder via ONNX Runtime.
//!
//! Takes an RGB face crop, resizes it to the model's square input, applies
//! per-image standardization, and returns the raw (unnormalized) embedding.

use crate::collaborators::{BoxError, FaceEmbedder};
use crate::models::ModelPreset;
use crate::types::Embedding;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// FaceNet-family embedder. The session is locked per call so one
/// embedder can serve several enrollment workers.
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    preset: ModelPreset,
}

impl OnnxEmbedder {
    /// Load the model for `preset` from `model_path`.
    pub fn load(model_path: &Path, preset: ModelPreset) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            model = preset.name,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session: Mutex::new(session),
            preset,
        })
    }

    pub fn preset(&self) -> ModelPreset {
        self.preset
    }

    /// Run the model on one face crop.
    pub fn extract(&self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        let input = preprocess(face, self.preset.input_size);

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedderError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.preset.dimension {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.preset.dimension,
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()))
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(&self, face: &RgbImage) -> Result<Embedding, BoxError> {
        Ok(self.extract(face)?)
    }

    fn dimension(&self) -> usize {
        self.preset.dimension
    }
}

/// Resize to `size`×`size` (bilinear) and standardize into an NHWC tensor:
/// `(x - mean) / max(std, 1/sqrt(n))` over all pixels and channels.
fn preprocess(face: &RgbImage, size: u32) -> Array4<f32> {
    let resized = image::imageops::resize(face, size, size, FilterType::Triangle);
    let side = size as usize;

    let n = (side * side * 3) as f32;
    let mean = resized.as_raw().iter().map(|&v| v as f32).sum::<f32>() / n;
    let variance = resized
        .as_raw()
        .iter()
        .map(|&v| (v as f32 - mean).powi(2))
        .sum::<f32>()
        / n;
    let std = variance.sqrt().max(1.0 / n.sqrt());

    let mut tensor = Array4::<f32>::zeros((1, side, side, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = (pixel.0[c] as f32 - mean) / std;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::new(37, 52);
        let tensor = preprocess(&face, 160);
        assert_eq!(tensor.shape(), &[1, 160, 160, 3]);
    }

    #[test]
    fn test_preprocess_standardizes() {
        let face = RgbImage::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 100]));
        let tensor = preprocess(&face, 32);

        let n = tensor.len() as f32;
        let mean = tensor.iter().sum::<f32>() / n;
        let var = tensor.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 1e-3, "mean {mean}");
        assert!((var - 1.0).abs() < 1e-2, "variance {var}");
    }

    #[test]
    fn test_preprocess_uniform_image_is_zero() {
        let face = RgbImage::from_pixel(20, 20, Rgb([90, 90, 90]));
        let tensor = preprocess(&face, 16);
        assert!(tensor.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load(Path::new("/nonexistent/facenet.onnx"), crate::models::FACENET);
        assert!(matches!(err, Err(EmbedderError::ModelNotFound(_))));
    }
}
