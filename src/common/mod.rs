pub mod frame;
pub mod geometry;
pub mod pacing;

pub use frame::Frame;
pub use geometry::Point2D;
