use serde::{Deserialize, Serialize};

/// Integer pixel coordinate. Absence is always modelled with `Option`, never (0, 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point2D {
    pub x: i32,
    pub y: i32,
}

impl Point2D {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Rounds a sub-pixel position to the nearest pixel.
    pub fn from_f64(x: f64, y: f64) -> Self {
        Self {
            x: x.round() as i32,
            y: y.round() as i32,
        }
    }
}

/// Maps a coordinate from a `from` sized raster onto a `to` sized raster, each axis
/// scaled independently.
pub fn rescale(x: f64, y: f64, from: (u32, u32), to: (u32, u32)) -> Point2D {
    let sx = to.0 as f64 / from.0.max(1) as f64;
    let sy = to.1 as f64 / from.1.max(1) as f64;
    Point2D::from_f64(x * sx, y * sy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_scales_axes_independently() {
        let p = rescale(10.0, 10.0, (100, 50), (200, 200));
        assert_eq!(p, Point2D::new(20, 40));
    }

    #[test]
    fn from_f64_rounds_half_away_from_zero() {
        assert_eq!(Point2D::from_f64(2.5, 3.4), Point2D::new(3, 3));
    }
}
