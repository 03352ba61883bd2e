use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DetectorSettings;
use crate::detection::color_models::{
    ColorLandmarkConfig, ColorLandmarkEstimator, ColorRegionConfig, ColorRegionSegmenter,
};
use crate::detection::detector::Detector;
use crate::detection::models::{PoseEstimator, Segmenter};
use crate::error::DetectorError;

const POSE_FILE: &str = "pose.json";
const SEGMENTATION_FILE: &str = "segmentation.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum PoseDescriptor {
    ColorLandmarks(ColorLandmarkConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SegmentationDescriptor {
    ColorRegions(ColorRegionConfig),
}

/// Directory holding one descriptor per model capability.
pub struct ModelDirectory {
    root: PathBuf,
}

impl ModelDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load_pose(&self) -> Result<Box<dyn PoseEstimator>, DetectorError> {
        let descriptor: PoseDescriptor = self.read_descriptor(POSE_FILE)?;
        let model: Box<dyn PoseEstimator> = match descriptor {
            PoseDescriptor::ColorLandmarks(config) => Box::new(ColorLandmarkEstimator::new(config)),
        };
        info!("Loaded pose model {} from {:?}", model.name(), self.root);
        Ok(model)
    }

    pub fn load_segmenter(&self) -> Result<Box<dyn Segmenter>, DetectorError> {
        let descriptor: SegmentationDescriptor = self.read_descriptor(SEGMENTATION_FILE)?;
        let model: Box<dyn Segmenter> = match descriptor {
            SegmentationDescriptor::ColorRegions(config) => {
                Box::new(ColorRegionSegmenter::new(config))
            }
        };
        info!("Loaded segmentation model {} from {:?}", model.name(), self.root);
        Ok(model)
    }

    /// Loads both capabilities and applies the configured thresholds.
    pub fn load_detector(&self, settings: &DetectorSettings) -> Result<Detector, DetectorError> {
        Ok(Detector::new(self.load_pose()?, self.load_segmenter()?)
            .with_keypoint_confidence(settings.keypoint_confidence)
            .with_marker_class(settings.marker_class))
    }

    fn read_descriptor<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Result<T, DetectorError> {
        let path = self.root.join(file);
        let contents = fs::read_to_string(&path).map_err(|e| DetectorError::ModelLoad {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&contents).map_err(|e| DetectorError::ModelLoad {
            path,
            reason: e.to_string(),
        })
    }
}
