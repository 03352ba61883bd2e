use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::RgbImage;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::geometry::rescale;
use crate::common::{Frame, Point2D};
use crate::detection::models::{PoseEstimator, Segmenter};
use crate::detection::types::{DetectionResult, KeypointKind, RegionMask};
use crate::error::DetectorError;

/// Shoulder and marker localization over the two model capabilities.
///
/// Not reentrant: the models keep internal state, so callers share it through
/// [`SharedDetector`].
pub struct Detector {
    pose: Box<dyn PoseEstimator>,
    segmenter: Box<dyn Segmenter>,
    keypoint_confidence: f32,
    marker_class: u32,
}

impl Detector {
    pub fn new(pose: Box<dyn PoseEstimator>, segmenter: Box<dyn Segmenter>) -> Self {
        Self {
            pose,
            segmenter,
            keypoint_confidence: 0.5,
            marker_class: 1,
        }
    }

    /// Keypoints scoring below this are treated as not found.
    pub fn with_keypoint_confidence(mut self, confidence: f32) -> Self {
        self.keypoint_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Segmentation class that identifies the handheld marker.
    pub fn with_marker_class(mut self, class_id: u32) -> Self {
        self.marker_class = class_id;
        self
    }

    /// Left and right shoulder of the first subject, each reported exactly as the
    /// model found it. A missing side is never inferred from the other.
    pub fn detect_shoulders(
        &mut self,
        frame: &Frame,
    ) -> Result<(Option<Point2D>, Option<Point2D>), DetectorError> {
        self.shoulders_in(&frame.to_rgb_image())
    }

    /// Median foreground pixel of the last marker region in model output order,
    /// scaled from mask resolution to frame resolution.
    pub fn detect_marker(&mut self, frame: &Frame) -> Result<Option<Point2D>, DetectorError> {
        self.marker_in(&frame.to_rgb_image(), frame.dimensions())
    }

    /// Runs both passes on one image conversion.
    pub fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, DetectorError> {
        let image = frame.to_rgb_image();
        let (left_shoulder, right_shoulder) = self.shoulders_in(&image)?;
        let marker = self.marker_in(&image, frame.dimensions())?;
        Ok(DetectionResult {
            left_shoulder,
            right_shoulder,
            marker,
        })
    }

    fn shoulders_in(
        &mut self,
        image: &RgbImage,
    ) -> Result<(Option<Point2D>, Option<Point2D>), DetectorError> {
        let poses = self.pose.estimate(image)?;
        let Some(pose) = poses.first() else {
            debug!("{} found no subject", self.pose.name());
            return Ok((None, None));
        };
        let confidence = self.keypoint_confidence;
        let pick = |kind: KeypointKind| {
            pose.find(kind)
                .filter(|k| k.score >= confidence)
                .map(|k| Point2D::from_f64(k.x as f64, k.y as f64))
        };
        Ok((
            pick(KeypointKind::LeftShoulder),
            pick(KeypointKind::RightShoulder),
        ))
    }

    fn marker_in(
        &mut self,
        image: &RgbImage,
        frame_size: (u32, u32),
    ) -> Result<Option<Point2D>, DetectorError> {
        let masks = self.segmenter.segment(image)?;
        Ok(marker_position(&masks, self.marker_class, frame_size))
    }
}

/// Picks the last region of `marker_class` that has any foreground ("last wins", not
/// best score) and returns its per-axis median pixel in frame coordinates.
pub fn marker_position(
    masks: &[RegionMask],
    marker_class: u32,
    frame_size: (u32, u32),
) -> Option<Point2D> {
    let region = masks
        .iter()
        .filter(|m| m.class_id == marker_class)
        .filter(|m| m.foreground().next().is_some())
        .last()?;
    let (mut xs, mut ys): (Vec<u32>, Vec<u32>) = region.foreground().unzip();
    let x = median(&mut xs)?;
    let y = median(&mut ys)?;
    Some(rescale(x, y, region.mask.dimensions(), frame_size))
}

fn median(values: &mut [u32]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid] as f64)
    } else {
        Some((values[mid - 1] as f64 + values[mid] as f64) / 2.0)
    }
}

/// The single exclusive handle on the loaded models, shared by the live tracker and
/// the capture verification.
///
/// Every `detect_*` sequence runs under one lock. Verification announces itself
/// before waiting, and the live path backs off while any verification is pending.
#[derive(Clone)]
pub struct SharedDetector {
    inner: Arc<Mutex<Detector>>,
    pending_verifications: Arc<AtomicUsize>,
}

struct PendingVerification<'a>(&'a AtomicUsize);

impl<'a> PendingVerification<'a> {
    fn register(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingVerification<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SharedDetector {
    pub fn new(detector: Detector) -> Self {
        Self {
            inner: Arc::new(Mutex::new(detector)),
            pending_verifications: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Background access. Returns `None` without running `f` when a verification is
    /// pending or the lock is not free within `wait`.
    pub fn run_live<R>(&self, wait: Duration, f: impl FnOnce(&mut Detector) -> R) -> Option<R> {
        if self.is_verification_pending() {
            return None;
        }
        let mut detector = self.inner.try_lock_for(wait)?;
        Some(f(&mut detector))
    }

    /// Priority access for verification, waiting at most `timeout` for the lock.
    pub fn run_exclusive<R>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut Detector) -> R,
    ) -> Result<R, DetectorError> {
        let _pending = PendingVerification::register(&self.pending_verifications);
        let Some(mut detector) = self.inner.try_lock_for(timeout) else {
            warn!("Detector still busy after {:?}, giving up on exclusive access", timeout);
            return Err(DetectorError::Contention(timeout));
        };
        Ok(f(&mut detector))
    }

    pub fn is_verification_pending(&self) -> bool {
        self.pending_verifications.load(Ordering::Acquire) > 0
    }

    #[cfg(test)]
    pub(crate) fn hold(&self) -> parking_lot::MutexGuard<'_, Detector> {
        self.inner.lock()
    }
}
