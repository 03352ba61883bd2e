use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::{RgbImage, imageops::FilterType};

use crate::error::FrameError;

const BYTES_PER_PIXEL: usize = 3;

/// One decoded RGB8 image from the video input.
///
/// The pixel buffer is immutable and reference counted, so cloning a frame hands
/// the reader its own handle on a buffer nobody can write to.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Bytes,
    width: u32,
    height: u32,
    sequence: u64,
    captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        pixels: Bytes,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(FrameError::BufferSize {
                actual: pixels.len(),
                expected,
                width,
                height,
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            sequence,
            captured_at: Utc::now(),
        })
    }

    pub fn from_rgb_image(image: RgbImage, sequence: u64) -> Result<Self, FrameError> {
        let (width, height) = image.dimensions();
        Self::new(width, height, Bytes::from(image.into_raw()), sequence)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Owned RGB copy of the frame.
    pub fn to_rgb_image(&self) -> RgbImage {
        // Length was checked in `new`, so the buffer always fits.
        RgbImage::from_raw(self.width, self.height, self.pixels.to_vec())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// Downscaled copy that fits inside `max_width` x `max_height`, keeping the
    /// aspect ratio and the sequence number. Frames that already fit are returned as is.
    pub fn fit_within(&self, max_width: u32, max_height: u32) -> Frame {
        if max_width == 0 || max_height == 0 {
            return self.clone();
        }
        if self.width <= max_width && self.height <= max_height {
            return self.clone();
        }
        let scale = f64::min(
            max_width as f64 / self.width as f64,
            max_height as f64 / self.height as f64,
        );
        let width = ((self.width as f64 * scale).round() as u32).max(1);
        let height = ((self.height as f64 * scale).round() as u32).max(1);
        let resized = image::imageops::resize(&self.to_rgb_image(), width, height, FilterType::Triangle);
        Frame {
            pixels: Bytes::from(resized.into_raw()),
            width,
            height,
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }
}
