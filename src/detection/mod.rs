pub mod color_models;
pub mod detector;
pub mod model_dir;
pub mod models;
pub mod types;

pub use color_models::{ColorLandmarkEstimator, ColorRegionSegmenter, ColorTag};
pub use detector::{Detector, SharedDetector, marker_position};
pub use model_dir::ModelDirectory;
pub use models::{PoseEstimator, Segmenter};
pub use types::{DetectionResult, Keypoint, KeypointKind, PoseEstimate, RegionMask};
