use image::RgbImage;

use crate::detection::types::{PoseEstimate, RegionMask};
use crate::error::DetectorError;

/// Keypoint model. Returns one estimate per subject, in model output order, and an
/// empty list when nobody is in view.
pub trait PoseEstimator: Send {
    fn estimate(&mut self, image: &RgbImage) -> Result<Vec<PoseEstimate>, DetectorError>;
    fn name(&self) -> &'static str;
}

/// Segmentation model. Returns labeled masks in model output order, possibly none.
pub trait Segmenter: Send {
    fn segment(&mut self, image: &RgbImage) -> Result<Vec<RegionMask>, DetectorError>;
    fn name(&self) -> &'static str;
}
