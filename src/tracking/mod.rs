pub mod live_tracker;
pub mod overlay;
pub mod timings;

pub use live_tracker::{CycleOutcome, LiveTracker, TrackerStats};
pub use overlay::LiveOverlay;
pub use timings::{DetectionPass, DetectionTimings, PassStats};
