//! Contracts for the detector, embedder, and attribute classifier that feed
//! the matching core.

use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::any::Any;
use thiserror::Error;

/// Error type returned by collaborator implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegionError {
    #[error("face region {bbox:?} lies outside the {width}x{height} image")]
    InvalidRegion {
        bbox: BoundingBox,
        width: u32,
        height: u32,
    },
}

/// Locates faces in an image.
pub trait FaceDetector: Send + Sync {
    /// Bounding boxes in the image's pixel coordinates; may be empty.
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, BoxError>;
}

/// Maps a cropped face to a fixed-length embedding.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, face: &RgbImage) -> Result<Embedding, BoxError>;

    /// Length of every embedding this embedder produces.
    fn dimension(&self) -> usize;
}

/// Produces a secondary label for a cropped face (e.g. "Mask" / "No Mask").
pub trait FaceAttributeClassifier: Send + Sync {
    fn classify(&self, face: &RgbImage) -> Result<String, BoxError>;
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Detector for images that are already face crops: reports one box
/// covering the whole image.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, BoxError> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox::new(0.0, 0.0, w as f32, h as f32)])
    }
}

/// Crop `bbox` out of `image`, failing if the box is not fully inside it.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> Result<RgbImage, RegionError> {
    let (width, height) = image.dimensions();
    if !bbox.fits_within(width, height) {
        return Err(RegionError::InvalidRegion {
            bbox: *bbox,
            width,
            height,
        });
    }

    let x = bbox.left.floor() as u32;
    let y = bbox.top.floor() as u32;
    let w = (bbox.width.round() as u32).clamp(1, width - x);
    let h = (bbox.height.round() as u32).clamp(1, height - y);

    Ok(image::imageops::crop_imm(image, x, y, w, h).to_image())
}
