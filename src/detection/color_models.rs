//! Colour-threshold reference backends.
//!
//! Shoulders are found from coloured skin tags placed on both acromions, the marker
//! from its colour key. They need no inference runtime, which makes them the default
//! backends for bench setups and headless runs.
use std::collections::VecDeque;

use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::detection::models::{PoseEstimator, Segmenter};
use crate::detection::types::{Keypoint, KeypointKind, PoseEstimate, RegionMask};
use crate::error::DetectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorTag {
    pub rgb: [u8; 3],
    /// Largest per-channel difference still counted as a match.
    pub tolerance: u8,
}

impl ColorTag {
    pub fn new(color: Rgb<u8>, tolerance: u8) -> Self {
        Self {
            rgb: color.0,
            tolerance,
        }
    }

    pub fn matches(&self, pixel: &Rgb<u8>) -> bool {
        pixel
            .0
            .iter()
            .zip(self.rgb.iter())
            .all(|(a, b)| a.abs_diff(*b) <= self.tolerance)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorLandmarkConfig {
    pub left: ColorTag,
    pub right: ColorTag,
    /// Pixel count at which a tag is reported with full confidence.
    pub min_pixels: u32,
}

pub struct ColorLandmarkEstimator {
    config: ColorLandmarkConfig,
}

impl ColorLandmarkEstimator {
    pub fn new(config: ColorLandmarkConfig) -> Self {
        Self { config }
    }
}

#[derive(Default)]
struct Centroid {
    sum_x: u64,
    sum_y: u64,
    count: u32,
}

impl Centroid {
    fn add(&mut self, x: u32, y: u32) {
        self.sum_x += x as u64;
        self.sum_y += y as u64;
        self.count += 1;
    }

    fn keypoint(&self, kind: KeypointKind, min_pixels: u32) -> Option<Keypoint> {
        if self.count == 0 {
            return None;
        }
        Some(Keypoint {
            kind,
            x: self.sum_x as f32 / self.count as f32,
            y: self.sum_y as f32 / self.count as f32,
            score: (self.count as f32 / min_pixels.max(1) as f32).min(1.0),
        })
    }
}

impl PoseEstimator for ColorLandmarkEstimator {
    fn estimate(&mut self, image: &RgbImage) -> Result<Vec<PoseEstimate>, DetectorError> {
        let mut left = Centroid::default();
        let mut right = Centroid::default();
        for (x, y, pixel) in image.enumerate_pixels() {
            if self.config.left.matches(pixel) {
                left.add(x, y);
            } else if self.config.right.matches(pixel) {
                right.add(x, y);
            }
        }

        let keypoints: Vec<Keypoint> = [
            left.keypoint(KeypointKind::LeftShoulder, self.config.min_pixels),
            right.keypoint(KeypointKind::RightShoulder, self.config.min_pixels),
        ]
        .into_iter()
        .flatten()
        .collect();

        if keypoints.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![PoseEstimate { keypoints }])
    }

    fn name(&self) -> &'static str {
        "color-landmarks"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorRegionConfig {
    pub marker: ColorTag,
    pub class_id: u32,
    /// Sampling step; masks are produced at `1 / stride` of the frame resolution.
    pub stride: u32,
    pub min_region_pixels: u32,
}

/// Emits one mask per 4-connected marker-coloured component, in scan order.
pub struct ColorRegionSegmenter {
    config: ColorRegionConfig,
}

impl ColorRegionSegmenter {
    pub fn new(config: ColorRegionConfig) -> Self {
        Self { config }
    }

    fn sample(&self, image: &RgbImage) -> (u32, u32, Vec<bool>) {
        let stride = self.config.stride.max(1);
        let (width, height) = image.dimensions();
        let mask_width = width.div_ceil(stride);
        let mask_height = height.div_ceil(stride);
        let mut grid = vec![false; (mask_width * mask_height) as usize];
        for my in 0..mask_height {
            for mx in 0..mask_width {
                let pixel = image.get_pixel(mx * stride, my * stride);
                grid[(my * mask_width + mx) as usize] = self.config.marker.matches(pixel);
            }
        }
        (mask_width, mask_height, grid)
    }
}

impl Segmenter for ColorRegionSegmenter {
    fn segment(&mut self, image: &RgbImage) -> Result<Vec<RegionMask>, DetectorError> {
        let (width, height, grid) = self.sample(image);
        let total = grid.len().max(1) as f32;
        let mut visited = vec![false; grid.len()];
        let mut regions = Vec::new();

        for start in 0..grid.len() {
            if !grid[start] || visited[start] {
                continue;
            }
            let mut mask = GrayImage::new(width, height);
            let mut size = 0u32;
            let mut queue = VecDeque::from([start]);
            visited[start] = true;
            while let Some(index) = queue.pop_front() {
                let (x, y) = (index as u32 % width, index as u32 / width);
                mask.put_pixel(x, y, Luma([255]));
                size += 1;
                let neighbours = [
                    (x > 0).then(|| index - 1),
                    (x + 1 < width).then(|| index + 1),
                    (y > 0).then(|| index - width as usize),
                    (y + 1 < height).then(|| index + width as usize),
                ];
                for next in neighbours.into_iter().flatten() {
                    if grid[next] && !visited[next] {
                        visited[next] = true;
                        queue.push_back(next);
                    }
                }
            }
            if size >= self.config.min_region_pixels {
                regions.push(RegionMask {
                    class_id: self.config.class_id,
                    score: size as f32 / total,
                    mask,
                });
            }
        }
        Ok(regions)
    }

    fn name(&self) -> &'static str {
        "color-regions"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{landmark_config, patient_scene, region_config, SKIN};

    #[test]
    fn finds_both_shoulder_tags() {
        let mut estimator = ColorLandmarkEstimator::new(landmark_config());
        let poses = estimator.estimate(&patient_scene(false)).unwrap();
        assert_eq!(poses.len(), 1);
        let left = poses[0].find(KeypointKind::LeftShoulder).unwrap();
        let right = poses[0].find(KeypointKind::RightShoulder).unwrap();
        assert_eq!((left.x, left.y), (40.0, 30.0));
        assert_eq!((right.x, right.y), (120.0, 30.0));
        assert_eq!(left.score, 1.0);
    }

    #[test]
    fn no_tags_means_no_subject() {
        let mut estimator = ColorLandmarkEstimator::new(landmark_config());
        let poses = estimator.estimate(&RgbImage::from_pixel(32, 32, SKIN)).unwrap();
        assert!(poses.is_empty());
    }

    #[test]
    fn segments_marker_at_reduced_resolution() {
        let mut segmenter = ColorRegionSegmenter::new(region_config());
        let regions = segmenter.segment(&patient_scene(true)).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].mask.dimensions(), (80, 60));
        assert_eq!(regions[0].class_id, 1);
        assert_eq!(regions[0].foreground().count(), 25);
    }

    #[test]
    fn separate_patches_become_separate_regions_in_scan_order() {
        let mut image = RgbImage::from_pixel(40, 40, SKIN);
        for (x, y) in [(2, 2), (3, 2), (2, 3), (3, 3), (30, 30), (31, 30), (30, 31), (31, 31)] {
            image.put_pixel(x, y, Rgb(region_config().marker.rgb));
        }
        let mut segmenter = ColorRegionSegmenter::new(ColorRegionConfig {
            stride: 1,
            ..region_config()
        });
        let regions = segmenter.segment(&image).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].foreground().next(), Some((2, 2)));
        assert_eq!(regions[1].foreground().next(), Some((30, 30)));
    }

    #[test]
    fn no_marker_yields_no_regions() {
        let mut segmenter = ColorRegionSegmenter::new(region_config());
        assert!(segmenter.segment(&patient_scene(false)).unwrap().is_empty());
    }
}
