use image::{Rgb, RgbImage};

use crate::capture::VerifiedLocalization;
use crate::common::{Frame, Point2D};
use crate::detection::DetectionResult;

const SHOULDER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const MARKER_COLOR: Rgb<u8> = Rgb([255, 0, 255]);
const CROSSHAIR_RADIUS: i32 = 8;

/// Draws whatever points `detection` carries onto `image`.
pub fn draw_detection(image: &mut RgbImage, detection: &DetectionResult) {
    if let (Some(left), Some(right)) = (detection.left_shoulder, detection.right_shoulder) {
        draw_line(image, left, right, SHOULDER_COLOR);
    }
    for shoulder in [detection.left_shoulder, detection.right_shoulder].into_iter().flatten() {
        draw_crosshair(image, shoulder, CROSSHAIR_RADIUS, SHOULDER_COLOR);
    }
    if let Some(marker) = detection.marker {
        draw_crosshair(image, marker, CROSSHAIR_RADIUS, MARKER_COLOR);
    }
}

/// Copy of the frozen frame with the verified points drawn on it.
pub fn annotate_verified(frame: &Frame, localization: &VerifiedLocalization) -> RgbImage {
    let mut image = frame.to_rgb_image();
    draw_detection(&mut image, &localization.as_detection());
    image
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_crosshair(image: &mut RgbImage, center: Point2D, radius: i32, color: Rgb<u8>) {
    for d in -radius..=radius {
        put(image, center.x + d, center.y, color);
        put(image, center.x, center.y + d, color);
    }
}

// Bresenham, clipped per pixel.
fn draw_line(image: &mut RgbImage, from: Point2D, to: Point2D, color: Rgb<u8>) {
    let (mut x, mut y) = (from.x, from.y);
    let dx = (to.x - from.x).abs();
    let dy = -(to.y - from.y).abs();
    let sx = if from.x < to.x { 1 } else { -1 };
    let sy = if from.y < to.y { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put(image, x, y, color);
        if x == to.x && y == to.y {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}
