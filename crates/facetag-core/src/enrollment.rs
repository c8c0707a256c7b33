//! Parallel one-shot enrollment of labelled reference images into a gallery.

use crate::collaborators::{crop_face, panic_message, FaceDetector, FaceEmbedder, RegionError};
use crate::gallery::{Gallery, GalleryError};
use crate::types::{BoundingBox, GalleryEntry};
use image::RgbImage;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Worker fan-out used when none is configured.
pub const DEFAULT_ENROLL_WORKERS: usize = 2;

/// Why a single reference image produced no gallery entry.
#[derive(Error, Debug)]
pub enum EnrollmentImageError {
    #[error("no face detected")]
    NoFace,
    #[error("expected exactly one face, found {0}")]
    MultipleFaces(usize),
    #[error(transparent)]
    InvalidRegion(#[from] RegionError),
    #[error("detector failed: {0}")]
    Detector(String),
    #[error("embedder failed: {0}")]
    Embedder(String),
    #[error("collaborator panicked: {0}")]
    Panicked(String),
}

/// Outcome of an enrollment run.
#[derive(Debug)]
pub struct Enrollment {
    pub gallery: Gallery,
    /// Images that yielded no usable face.
    pub skipped: usize,
}

/// Builds a gallery from `(label, image)` pairs across a fixed number of
/// worker threads.
pub struct EnrollmentPipeline {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    workers: usize,
}

impl EnrollmentPipeline {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        workers: usize,
    ) -> Self {
        Self {
            detector,
            embedder,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Enroll every image in `batch`, blocking until all workers finish.
    ///
    /// The batch is split into contiguous sub-batches, one per worker.
    /// Images that fail individually are counted in `skipped`; entry order
    /// across workers is unspecified. Fails only if the embedder produced
    /// embeddings of differing lengths.
    pub fn build(&self, batch: Vec<(String, RgbImage)>) -> Result<Enrollment, GalleryError> {
        let total = batch.len();
        let entries = Mutex::new(Vec::with_capacity(total));
        let skipped = AtomicUsize::new(0);

        if total > 0 {
            let chunk_size = total.div_ceil(self.workers);
            tracing::info!(
                images = total,
                workers = total.div_ceil(chunk_size),
                "enrollment started"
            );

            std::thread::scope(|scope| {
                for (worker, sub_batch) in batch.chunks(chunk_size).enumerate() {
                    let entries = &entries;
                    let skipped = &skipped;
                    scope.spawn(move || {
                        for (label, image) in sub_batch {
                            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                                self.enroll_one(label, image)
                            }))
                            .unwrap_or_else(|payload| {
                                Err(EnrollmentImageError::Panicked(panic_message(payload.as_ref())))
                            });
                            match outcome {
                                Ok(entry) => entries
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .push(entry),
                                Err(err @ EnrollmentImageError::Panicked(_)) => {
                                    tracing::warn!(worker, label = %label, error = %err, "image skipped");
                                    skipped.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(err) => {
                                    tracing::debug!(worker, label = %label, error = %err, "image skipped");
                                    skipped.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    });
                }
            });
        }

        let entries = entries.into_inner().unwrap_or_else(PoisonError::into_inner);
        let skipped = skipped.into_inner();
        let gallery = Gallery::from_entries(entries)?;

        tracing::info!(
            enrolled = gallery.len(),
            skipped,
            "enrollment finished"
        );

        Ok(Enrollment { gallery, skipped })
    }

    /// Detect exactly one in-bounds face, crop it, and embed it.
    fn enroll_one(&self, label: &str, image: &RgbImage) -> Result<GalleryEntry, EnrollmentImageError> {
        let (width, height) = image.dimensions();
        let boxes = self
            .detector
            .detect(image)
            .map_err(|e| EnrollmentImageError::Detector(e.to_string()))?;

        let valid: Vec<&BoundingBox> = boxes.iter().filter(|b| b.fits_within(width, height)).collect();
        let bbox = match valid.as_slice() {
            [one] => *one,
            [] => {
                return Err(match boxes.first() {
                    Some(b) => RegionError::InvalidRegion {
                        bbox: *b,
                        width,
                        height,
                    }
                    .into(),
                    None => EnrollmentImageError::NoFace,
                })
            }
            many => return Err(EnrollmentImageError::MultipleFaces(many.len())),
        };

        let face = crop_face(image, bbox)?;
        let embedding = self
            .embedder
            .embed(&face)
            .map_err(|e| EnrollmentImageError::Embedder(e.to_string()))?;

        Ok(GalleryEntry::new(label, embedding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BoxError, FullFrameDetector};
    use crate::metric::MetricError;
    use crate::types::Embedding;
    use image::Rgb;

    /// Finds a face only when the top-left pixel is non-black.
    struct MarkerDetector;

    impl FaceDetector for MarkerDetector {
        fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, BoxError> {
            let [r, _, _] = image.get_pixel(0, 0).0;
            match r {
                0 => Ok(Vec::new()),
                255 => Err("detector exploded".into()),
                _ => Ok(vec![BoundingBox::new(0.0, 0.0, 4.0, 4.0)]),
            }
        }
    }

    /// Embeds a crop as its top-left pixel's channels.
    struct PixelEmbedder;

    impl FaceEmbedder for PixelEmbedder {
        fn embed(&self, face: &RgbImage) -> Result<Embedding, BoxError> {
            let [r, g, b] = face.get_pixel(0, 0).0;
            Ok(Embedding::new(vec![r as f32, g as f32, b as f32]))
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    fn image_with_marker(r: u8) -> RgbImage {
        let mut image = RgbImage::new(8, 8);
        image.put_pixel(0, 0, Rgb([r, 10, 20]));
        image
    }

    fn pipeline(workers: usize) -> EnrollmentPipeline {
        EnrollmentPipeline::new(Arc::new(MarkerDetector), Arc::new(PixelEmbedder), workers)
    }

    fn ten_image_batch() -> Vec<(String, RgbImage)> {
        (0..10u8)
            .map(|i| {
                let marker = if matches!(i, 2 | 5 | 9) { 0 } else { i + 1 };
                (format!("person{}", i % 4), image_with_marker(marker))
            })
            .collect()
    }

    #[test]
    fn test_skips_faceless_images_for_any_worker_count() {
        for workers in [1, 2, 3, 4, 10, 16] {
            let result = pipeline(workers).build(ten_image_batch()).unwrap();
            assert_eq!(result.gallery.len(), 7, "workers = {workers}");
            assert_eq!(result.skipped, 3, "workers = {workers}");
        }
    }

    #[test]
    fn test_membership_independent_of_partitioning() {
        let sorted = |g: &Gallery| {
            let mut pairs: Vec<(String, Vec<f32>)> = g
                .iter()
                .map(|e| (e.name.clone(), e.embedding.values.clone()))
                .collect();
            pairs.sort_by(|a, b| a.partial_cmp(b).unwrap());
            pairs
        };

        let one = pipeline(1).build(ten_image_batch()).unwrap();
        let two = pipeline(2).build(ten_image_batch()).unwrap();
        assert_eq!(sorted(&one.gallery), sorted(&two.gallery));
    }

    #[test]
    fn test_detector_error_counts_as_skipped() {
        let batch = vec![
            ("a".to_string(), image_with_marker(255)),
            ("b".to_string(), image_with_marker(7)),
        ];
        let result = pipeline(2).build(batch).unwrap();
        assert_eq!(result.gallery.len(), 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.gallery.entries()[0].name, "b");
    }

    #[test]
    fn test_out_of_bounds_box_is_skipped() {
        struct OverflowDetector;
        impl FaceDetector for OverflowDetector {
            fn detect(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>, BoxError> {
                Ok(vec![BoundingBox::new(6.0, 6.0, 4.0, 4.0)])
            }
        }

        let p = EnrollmentPipeline::new(Arc::new(OverflowDetector), Arc::new(PixelEmbedder), 2);
        let result = p.build(vec![("a".to_string(), image_with_marker(9))]).unwrap();
        assert!(result.gallery.is_empty());
        assert_eq!(result.skipped, 1);
    }

    #[test]
    fn test_multiple_faces_are_skipped() {
        struct TwoFaces;
        impl FaceDetector for TwoFaces {
            fn detect(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>, BoxError> {
                Ok(vec![
                    BoundingBox::new(0.0, 0.0, 2.0, 2.0),
                    BoundingBox::new(4.0, 4.0, 2.0, 2.0),
                ])
            }
        }

        let p = EnrollmentPipeline::new(Arc::new(TwoFaces), Arc::new(PixelEmbedder), 1);
        let err = p.enroll_one("a", &image_with_marker(9)).unwrap_err();
        assert!(matches!(err, EnrollmentImageError::MultipleFaces(2)));
    }

    #[test]
    fn test_empty_batch() {
        let result = pipeline(2).build(Vec::new()).unwrap();
        assert!(result.gallery.is_empty());
        assert_eq!(result.skipped, 0);
    }

    #[test]
    fn test_zero_workers_clamped_to_one() {
        let p = pipeline(0);
        assert_eq!(p.workers(), 1);
        assert_eq!(p.build(ten_image_batch()).unwrap().gallery.len(), 7);
    }

    #[test]
    fn test_inconsistent_embedding_lengths_fail() {
        /// Embedding length depends on the image width.
        struct WidthEmbedder;
        impl FaceEmbedder for WidthEmbedder {
            fn embed(&self, face: &RgbImage) -> Result<Embedding, BoxError> {
                Ok(Embedding::new(vec![1.0; face.width() as usize]))
            }
            fn dimension(&self) -> usize {
                0
            }
        }

        let p = EnrollmentPipeline::new(Arc::new(FullFrameDetector), Arc::new(WidthEmbedder), 2);
        let batch = vec![
            ("a".to_string(), RgbImage::new(4, 4)),
            ("b".to_string(), RgbImage::new(6, 4)),
        ];
        let err = p.build(batch).unwrap_err();
        assert!(matches!(
            err,
            GalleryError::Metric(MetricError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_panicking_detector_skips_only_that_image() {
        /// Panics on images whose top-left red channel is 99.
        struct PanickyDetector;

        impl FaceDetector for PanickyDetector {
            fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, BoxError> {
                if image.get_pixel(0, 0).0[0] == 99 {
                    panic!("detector crashed");
                }
                MarkerDetector.detect(image)
            }
        }

        let p = EnrollmentPipeline::new(Arc::new(PanickyDetector), Arc::new(PixelEmbedder), 2);
        let batch = vec![
            ("ann".to_string(), image_with_marker(1)),
            ("bob".to_string(), image_with_marker(99)),
            ("cat".to_string(), image_with_marker(3)),
            ("dan".to_string(), image_with_marker(4)),
        ];
        let result = p.build(batch).unwrap();
        assert_eq!(result.gallery.len(), 3);
        assert_eq!(result.skipped, 1);
        assert!(result.gallery.names().iter().all(|(name, _)| name != "bob"));
    }
}
