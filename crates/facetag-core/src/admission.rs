//! Single-flight admission of live frames.
//!
//! At most one frame is classified at a time. Frames submitted while a
//! classification is running are dropped, never queued, so the effective
//! frame rate degrades under load instead of memory growing.

use crate::collaborators::{
    crop_face, panic_message, FaceAttributeClassifier, FaceDetector, FaceEmbedder, RegionError,
};
use crate::gallery::Gallery;
use crate::matcher::IdentityMatcher;
use crate::metric::MetricError;
use crate::types::{BoundingBox, Prediction};
use image::RgbImage;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Predictions for the most recently completed frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameReport {
    /// Sequence number assigned at admission; 0 before any frame completes.
    pub sequence: u64,
    pub predictions: Vec<Prediction>,
    /// Faces detected in the frame that could not be classified.
    pub skipped_faces: usize,
}

/// Outcome of [`FrameAdmissionController::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The frame was dispatched under this sequence number.
    Accepted(u64),
    /// A frame was already in flight; this one was discarded.
    Dropped,
}

#[derive(Error, Debug)]
enum FaceError {
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("embedder failed: {0}")]
    Embedder(String),
    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// Detection, embedding and classification of one frame.
pub struct FrameProcessor {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    attributes: Option<Arc<dyn FaceAttributeClassifier>>,
    matcher: IdentityMatcher,
    gallery: Arc<Gallery>,
}

impl FrameProcessor {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        matcher: IdentityMatcher,
        gallery: Arc<Gallery>,
    ) -> Self {
        Self {
            detector,
            embedder,
            attributes: None,
            matcher,
            gallery,
        }
    }

    /// Attach a classifier for the secondary label (e.g. mask status).
    pub fn with_attributes(mut self, classifier: Arc<dyn FaceAttributeClassifier>) -> Self {
        self.attributes = Some(classifier);
        self
    }

    /// Classify every detected face in `frame`.
    ///
    /// A face that cannot be cropped, embedded or compared is skipped; the
    /// remaining faces are still classified. A detector failure yields a
    /// report with no predictions.
    pub fn process(&self, sequence: u64, frame: &RgbImage) -> FrameReport {
        let boxes = match self.detector.detect(frame) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(sequence, error = %e, "face detection failed; frame yields no predictions");
                return FrameReport {
                    sequence,
                    ..FrameReport::default()
                };
            }
        };

        let mut predictions = Vec::with_capacity(boxes.len());
        let mut skipped_faces = 0;

        for bbox in &boxes {
            match self.predict_face(frame, bbox) {
                Ok(prediction) => predictions.push(prediction),
                Err(FaceError::Metric(e)) => {
                    tracing::error!(sequence, error = %e, "embedding does not match gallery; face skipped");
                    skipped_faces += 1;
                }
                Err(e) => {
                    tracing::debug!(sequence, error = %e, "face skipped");
                    skipped_faces += 1;
                }
            }
        }

        tracing::debug!(
            sequence,
            faces = boxes.len(),
            classified = predictions.len(),
            skipped_faces,
            "frame processed"
        );

        FrameReport {
            sequence,
            predictions,
            skipped_faces,
        }
    }

    fn predict_face(&self, frame: &RgbImage, bbox: &BoundingBox) -> Result<Prediction, FaceError> {
        let face = crop_face(frame, bbox)?;
        let embedding = self
            .embedder
            .embed(&face)
            .map_err(|e| FaceError::Embedder(e.to_string()))?;
        let result = self.matcher.classify(&embedding, &self.gallery)?;

        let secondary = self.attributes.as_ref().and_then(|c| match c.classify(&face) {
            Ok(label) => Some(label),
            Err(e) => {
                tracing::debug!(error = %e, "attribute classifier failed");
                None
            }
        });

        Ok(Prediction {
            bbox: *bbox,
            label: result.label,
            score: result.score,
            secondary,
        })
    }
}

/// Idle/Busy gate in front of a dedicated classification thread.
pub struct FrameAdmissionController {
    busy: Arc<AtomicBool>,
    next_sequence: AtomicU64,
    tx: Option<mpsc::Sender<(u64, RgbImage)>>,
    reports: watch::Receiver<FrameReport>,
    worker: Option<JoinHandle<()>>,
}

impl FrameAdmissionController {
    /// Spawn the classification thread.
    ///
    /// Frames taking longer than `slow_frame` are logged; they are never
    /// cancelled.
    pub fn spawn(processor: FrameProcessor, slow_frame: Duration) -> std::io::Result<Self> {
        let busy = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel::<(u64, RgbImage)>(1);
        let (report_tx, reports) = watch::channel(FrameReport::default());

        let worker_busy = Arc::clone(&busy);
        let worker = std::thread::Builder::new()
            .name("facetag-frames".into())
            .spawn(move || {
                tracing::info!("frame worker started");
                while let Some((sequence, frame)) = rx.blocking_recv() {
                    let started = Instant::now();
                    let report = match panic::catch_unwind(AssertUnwindSafe(|| {
                        processor.process(sequence, &frame)
                    })) {
                        Ok(report) => report,
                        Err(payload) => {
                            tracing::error!(
                                sequence,
                                panic = %panic_message(payload.as_ref()),
                                "frame classification panicked; frame yields no predictions"
                            );
                            FrameReport {
                                sequence,
                                ..FrameReport::default()
                            }
                        }
                    };

                    let elapsed = started.elapsed();
                    if elapsed > slow_frame {
                        tracing::warn!(
                            sequence,
                            elapsed_ms = elapsed.as_millis() as u64,
                            budget_ms = slow_frame.as_millis() as u64,
                            "frame classification exceeded budget"
                        );
                    }

                    // Single worker: this report is published before the
                    // next admitted frame can be received.
                    worker_busy.store(false, Ordering::Release);
                    report_tx.send_replace(report);
                }
                tracing::info!("frame worker exiting");
            })?;

        Ok(Self {
            busy,
            next_sequence: AtomicU64::new(1),
            tx: Some(tx),
            reports,
            worker: Some(worker),
        })
    }

    /// Offer a frame. Returns immediately; the frame is dropped if another
    /// one is still being classified.
    pub fn submit(&self, frame: RgbImage) -> Admission {
        let Some(tx) = &self.tx else {
            return Admission::Dropped;
        };

        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("frame dropped: classification in flight");
            return Admission::Dropped;
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        match tx.try_send((sequence, frame)) {
            Ok(()) => Admission::Accepted(sequence),
            Err(e) => {
                tracing::warn!(sequence, error = %e, "frame worker unavailable");
                self.busy.store(false, Ordering::Release);
                Admission::Dropped
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Receiver that observes every published report.
    pub fn subscribe(&self) -> watch::Receiver<FrameReport> {
        self.reports.clone()
    }

    /// The most recently published report.
    pub fn latest(&self) -> FrameReport {
        self.reports.borrow().clone()
    }

    /// Stop accepting frames and wait for the in-flight one to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("frame worker panicked");
            }
        }
    }
}

impl Drop for FrameAdmissionController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BoxError, FullFrameDetector};
    use crate::metric::DistanceMetric;
    use crate::types::{Embedding, GalleryEntry, UNKNOWN_LABEL};
    use image::Rgb;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;

    /// Embeds a crop as the mean of its red and green channels.
    struct ColorEmbedder;

    impl FaceEmbedder for ColorEmbedder {
        fn embed(&self, face: &RgbImage) -> Result<Embedding, BoxError> {
            let n = (face.width() * face.height()) as f32;
            let (mut r, mut g) = (0.0f32, 0.0f32);
            for p in face.pixels() {
                r += p.0[0] as f32;
                g += p.0[1] as f32;
            }
            Ok(Embedding::new(vec![r / n, g / n]))
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    /// Reports fixed boxes, blocking until released when gated.
    struct ScriptedDetector {
        boxes: Vec<BoundingBox>,
        gate: Option<Mutex<std_mpsc::Receiver<()>>>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>, BoxError> {
            if let Some(gate) = &self.gate {
                gate.lock().unwrap().recv()?;
            }
            Ok(self.boxes.clone())
        }
    }

    struct FailingDetector;

    impl FaceDetector for FailingDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>, BoxError> {
            Err("camera glitch".into())
        }
    }

    struct MaskClassifier;

    impl FaceAttributeClassifier for MaskClassifier {
        fn classify(&self, _face: &RgbImage) -> Result<String, BoxError> {
            Ok("No Mask".to_string())
        }
    }

    fn gallery() -> Arc<Gallery> {
        Arc::new(
            Gallery::from_entries(vec![
                GalleryEntry::new("red", vec![255.0, 0.0]),
                GalleryEntry::new("green", vec![0.0, 255.0]),
            ])
            .unwrap(),
        )
    }

    fn processor(detector: Arc<dyn FaceDetector>) -> FrameProcessor {
        let matcher = IdentityMatcher::new(DistanceMetric::Cosine, 0.9).unwrap();
        FrameProcessor::new(detector, Arc::new(ColorEmbedder), matcher, gallery())
    }

    /// 20x10 frame: left half red, right half green.
    fn split_frame() -> RgbImage {
        RgbImage::from_fn(20, 10, |x, _| {
            if x < 10 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 255, 0])
            }
        })
    }

    #[test]
    fn test_process_classifies_each_face() {
        let detector = ScriptedDetector {
            boxes: vec![
                BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                BoundingBox::new(10.0, 0.0, 10.0, 10.0),
            ],
            gate: None,
        };
        let report = processor(Arc::new(detector)).process(7, &split_frame());

        assert_eq!(report.sequence, 7);
        assert_eq!(report.skipped_faces, 0);
        let labels: Vec<&str> = report.predictions.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["red", "green"]);
        assert_eq!(report.predictions[1].bbox, BoundingBox::new(10.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn test_invalid_face_does_not_abort_frame() {
        let detector = ScriptedDetector {
            boxes: vec![
                BoundingBox::new(15.0, 0.0, 10.0, 10.0),
                BoundingBox::new(10.0, 0.0, 10.0, 10.0),
            ],
            gate: None,
        };
        let report = processor(Arc::new(detector)).process(1, &split_frame());

        assert_eq!(report.skipped_faces, 1);
        assert_eq!(report.predictions.len(), 1);
        assert_eq!(report.predictions[0].label, "green");
    }

    #[test]
    fn test_mixed_face_is_unknown() {
        let detector = ScriptedDetector {
            boxes: vec![BoundingBox::new(5.0, 0.0, 10.0, 10.0)],
            gate: None,
        };
        let report = processor(Arc::new(detector)).process(1, &split_frame());
        assert_eq!(report.predictions[0].label, UNKNOWN_LABEL);
    }

    #[test]
    fn test_detector_failure_yields_empty_report() {
        let report = processor(Arc::new(FailingDetector)).process(3, &split_frame());
        assert_eq!(report.sequence, 3);
        assert!(report.predictions.is_empty());
    }

    #[test]
    fn test_secondary_label_attached() {
        let report = processor(Arc::new(FullFrameDetector))
            .with_attributes(Arc::new(MaskClassifier))
            .process(1, &RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])));
        assert_eq!(report.predictions[0].label, "red");
        assert_eq!(report.predictions[0].secondary.as_deref(), Some("No Mask"));
    }

    #[tokio::test]
    async fn test_drops_frames_while_busy() {
        let (release, gate) = std_mpsc::channel();
        let detector = ScriptedDetector {
            boxes: vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)],
            gate: Some(Mutex::new(gate)),
        };
        let controller =
            FrameAdmissionController::spawn(processor(Arc::new(detector)), Duration::from_secs(5))
                .unwrap();
        let mut reports = controller.subscribe();

        assert_eq!(controller.submit(split_frame()), Admission::Accepted(1));
        assert!(controller.is_busy());
        assert_eq!(controller.submit(split_frame()), Admission::Dropped);
        assert_eq!(controller.submit(split_frame()), Admission::Dropped);

        release.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), reports.changed())
            .await
            .unwrap()
            .unwrap();
        let report = reports.borrow_and_update().clone();
        assert_eq!(report.sequence, 1);
        assert_eq!(report.predictions[0].label, "red");
        assert!(!controller.is_busy());

        assert_eq!(controller.submit(split_frame()), Admission::Accepted(2));
        release.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), reports.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(controller.latest().sequence, 2);

        controller.shutdown();
    }

    /// Panics on the first frame, then behaves like `FullFrameDetector`.
    struct PanicOnce {
        fired: AtomicBool,
    }

    impl FaceDetector for PanicOnce {
        fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, BoxError> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                panic!("detector crashed");
            }
            FullFrameDetector.detect(image)
        }
    }

    #[tokio::test]
    async fn test_panicking_frame_releases_gate() {
        let detector = PanicOnce {
            fired: AtomicBool::new(false),
        };
        let controller =
            FrameAdmissionController::spawn(processor(Arc::new(detector)), Duration::from_secs(5))
                .unwrap();
        let mut reports = controller.subscribe();

        assert_eq!(controller.submit(split_frame()), Admission::Accepted(1));
        tokio::time::timeout(Duration::from_secs(5), reports.changed())
            .await
            .unwrap()
            .unwrap();
        let report = reports.borrow_and_update().clone();
        assert_eq!(report.sequence, 1);
        assert!(report.predictions.is_empty());
        assert!(!controller.is_busy());

        let red = RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]));
        assert_eq!(controller.submit(red), Admission::Accepted(2));
        tokio::time::timeout(Duration::from_secs(5), reports.changed())
            .await
            .unwrap()
            .unwrap();
        let report = reports.borrow_and_update().clone();
        assert_eq!(report.sequence, 2);
        assert_eq!(report.predictions[0].label, "red");

        controller.shutdown();
    }

    #[test]
    fn test_submit_after_worker_gone_is_dropped() {
        let mut controller =
            FrameAdmissionController::spawn(processor(Arc::new(FullFrameDetector)), Duration::from_secs(5))
                .unwrap();
        controller.stop();
        assert_eq!(controller.submit(split_frame()), Admission::Dropped);
        assert!(!controller.is_busy());
    }
}
