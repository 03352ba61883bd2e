//! Scripted models and synthetic frames shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{GrayImage, Luma, Rgb, RgbImage};
use parking_lot::Mutex;

use crate::common::Frame;
use crate::detection::color_models::{ColorLandmarkConfig, ColorRegionConfig, ColorTag};
use crate::detection::models::{PoseEstimator, Segmenter};
use crate::detection::types::{Keypoint, KeypointKind, PoseEstimate, RegionMask};
use crate::error::{DetectorError, SourceError};
use crate::intake::VideoInput;

pub const SKIN: Rgb<u8> = Rgb([200, 170, 150]);
pub const LEFT_TAG: Rgb<u8> = Rgb([0, 200, 0]);
pub const RIGHT_TAG: Rgb<u8> = Rgb([0, 0, 220]);
pub const MARKER: Rgb<u8> = Rgb([230, 20, 20]);

pub fn blank_frame(width: u32, height: u32, sequence: u64) -> Frame {
    Frame::from_rgb_image(RgbImage::new(width, height), sequence).unwrap()
}

pub fn shoulders(left: (f32, f32), right: (f32, f32)) -> PoseEstimate {
    PoseEstimate {
        keypoints: vec![
            Keypoint {
                kind: KeypointKind::LeftShoulder,
                x: left.0,
                y: left.1,
                score: 0.9,
            },
            Keypoint {
                kind: KeypointKind::RightShoulder,
                x: right.0,
                y: right.1,
                score: 0.9,
            },
        ],
    }
}

pub fn mask_with(width: u32, height: u32, class_id: u32, points: &[(u32, u32)]) -> RegionMask {
    let mut mask = GrayImage::new(width, height);
    for &(x, y) in points {
        mask.put_pixel(x, y, Luma([255]));
    }
    RegionMask {
        class_id,
        score: 0.5,
        mask,
    }
}

/// Pose model returning whatever the test scripts, counting calls.
#[derive(Clone)]
pub struct ScriptedPose {
    pub poses: Arc<Mutex<Vec<PoseEstimate>>>,
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl ScriptedPose {
    pub fn new(poses: Vec<PoseEstimate>) -> Self {
        Self {
            poses: Arc::new(Mutex::new(poses)),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PoseEstimator for ScriptedPose {
    fn estimate(&mut self, _image: &RgbImage) -> Result<Vec<PoseEstimate>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(self.poses.lock().clone())
    }

    fn name(&self) -> &'static str {
        "scripted-pose"
    }
}

#[derive(Clone)]
pub struct ScriptedSegmenter {
    pub masks: Arc<Mutex<Vec<RegionMask>>>,
    pub fail: Arc<Mutex<bool>>,
}

impl ScriptedSegmenter {
    pub fn new(masks: Vec<RegionMask>) -> Self {
        Self {
            masks: Arc::new(Mutex::new(masks)),
            fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Segmenter for ScriptedSegmenter {
    fn segment(&mut self, _image: &RgbImage) -> Result<Vec<RegionMask>, DetectorError> {
        if *self.fail.lock() {
            return Err(DetectorError::Inference {
                model: "scripted-segmenter",
                reason: "scripted failure".to_string(),
            });
        }
        Ok(self.masks.lock().clone())
    }

    fn name(&self) -> &'static str {
        "scripted-segmenter"
    }
}

/// Serves its images once, then every read fails as if the device went away.
pub struct FailingInput {
    images: Vec<RgbImage>,
}

impl FailingInput {
    pub fn after(images: Vec<RgbImage>) -> Self {
        Self { images }
    }
}

impl VideoInput for FailingInput {
    fn open(&mut self) -> Result<(), SourceError> {
        self.images.reverse();
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        match self.images.pop() {
            Some(image) => Ok(Some(image)),
            None => Err(SourceError::Read(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device unplugged",
            ))),
        }
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn describe(&self) -> String {
        "failing input".to_string()
    }
}

fn fill(image: &mut RgbImage, center: (u32, u32), half: u32, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    for y in center.1.saturating_sub(half)..(center.1 + half + 1).min(height) {
        for x in center.0.saturating_sub(half)..(center.0 + half + 1).min(width) {
            image.put_pixel(x, y, color);
        }
    }
}

/// 160x120 scene with skin-coloured background, shoulder tags at (40, 30) and
/// (120, 30), and optionally a marker patch centred on (80, 70).
pub fn patient_scene(with_marker: bool) -> RgbImage {
    let mut image = RgbImage::from_pixel(160, 120, SKIN);
    fill(&mut image, (40, 30), 3, LEFT_TAG);
    fill(&mut image, (120, 30), 3, RIGHT_TAG);
    if with_marker {
        fill(&mut image, (80, 70), 4, MARKER);
    }
    image
}

/// Same scene with the marker centred on `center` (even coordinates stay exact
/// under the stride 2 segmenter).
pub fn patient_scene_marker_at(center: (u32, u32)) -> RgbImage {
    let mut image = patient_scene(false);
    fill(&mut image, center, 4, MARKER);
    image
}

pub fn landmark_config() -> ColorLandmarkConfig {
    ColorLandmarkConfig {
        left: ColorTag::new(LEFT_TAG, 40),
        right: ColorTag::new(RIGHT_TAG, 40),
        min_pixels: 9,
    }
}

pub fn region_config() -> ColorRegionConfig {
    ColorRegionConfig {
        marker: ColorTag::new(MARKER, 40),
        class_id: 1,
        stride: 2,
        min_region_pixels: 4,
    }
}
