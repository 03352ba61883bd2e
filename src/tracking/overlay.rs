use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::detection::DetectionResult;

/// Latest live estimate for drawing over the preview. Replaced wholesale on every
/// published cycle and never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveOverlay {
    pub detection: DetectionResult,
    /// Sequence of the frame the estimate was computed on, `None` before the first cycle.
    pub frame_sequence: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
    /// Bumped on every clear so stale cycles can't republish over a reset.
    pub epoch: u64,
}

impl LiveOverlay {
    pub fn is_blank(&self) -> bool {
        self.frame_sequence.is_none()
    }
}
