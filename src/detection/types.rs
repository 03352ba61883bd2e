use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::common::Point2D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeypointKind {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

/// Named landmark in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub kind: KeypointKind,
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

/// All keypoints the pose model produced for one subject.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseEstimate {
    pub keypoints: Vec<Keypoint>,
}

impl PoseEstimate {
    pub fn find(&self, kind: KeypointKind) -> Option<&Keypoint> {
        self.keypoints.iter().find(|k| k.kind == kind)
    }
}

/// One labeled region from the segmentation model. Non-zero mask pixels are foreground;
/// the mask may be smaller than the frame it was computed from.
#[derive(Debug, Clone)]
pub struct RegionMask {
    pub class_id: u32,
    pub score: f32,
    pub mask: GrayImage,
}

impl RegionMask {
    pub fn foreground(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.mask
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] > 0)
            .map(|(x, y, _)| (x, y))
    }
}

/// Shoulder and marker positions found in one image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub left_shoulder: Option<Point2D>,
    pub right_shoulder: Option<Point2D>,
    pub marker: Option<Point2D>,
}

impl DetectionResult {
    pub fn has_both_shoulders(&self) -> bool {
        self.left_shoulder.is_some() && self.right_shoulder.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.left_shoulder.is_none() && self.right_shoulder.is_none() && self.marker.is_none()
    }
}
