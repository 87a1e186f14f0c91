//! OpenCV-backed corner seeding and pyramidal Lucas-Kanade flow.

use image::{GrayImage, imageops};
use ml_core::BoundingBox;
use opencv::{
    core::{self, Mat, Point2f, Size, TermCriteria, Vector},
    imgproc,
    prelude::*,
    video,
};
use tracing::warn;

use super::{
    features::FeatureExtractor,
    motion::{MotionEstimate, MotionEstimator, Point2},
};

/// Copy a grayscale buffer into an owned 8-bit single-channel `Mat`.
fn gray_mat(image: &GrayImage) -> opencv::Result<Mat> {
    Mat::new_rows_cols_with_data(image.height() as i32, image.width() as i32, image.as_raw().as_slice())?
        .try_clone()
}

/// `cv::calcOpticalFlowPyrLK` with a per-point status mask.
#[derive(Debug, Clone, Copy)]
pub struct LucasKanade {
    /// Side of the square search window, in pixels.
    pub window: i32,
    pub max_level: i32,
    pub max_iterations: i32,
    pub epsilon: f64,
    pub min_eigen_threshold: f64,
}

impl Default for LucasKanade {
    fn default() -> Self {
        Self {
            window: 15,
            max_level: 2,
            max_iterations: 10,
            epsilon: 0.03,
            min_eigen_threshold: 1e-4,
        }
    }
}

impl LucasKanade {
    fn try_estimate(&self, prev: &GrayImage, next: &GrayImage, points: &[Point2]) -> opencv::Result<MotionEstimate> {
        let prev = gray_mat(prev)?;
        let next = gray_mat(next)?;
        let prev_pts: Vector<Point2f> = points.iter().map(|p| Point2f::new(p.x, p.y)).collect();
        let mut next_pts = Vector::<Point2f>::new();
        let mut status = Vector::<u8>::new();
        let mut err = Vector::<f32>::new();
        let criteria = TermCriteria::new(
            core::TermCriteria_Type::COUNT as i32 | core::TermCriteria_Type::EPS as i32,
            self.max_iterations,
            self.epsilon,
        )?;

        video::calc_optical_flow_pyr_lk(
            &prev,
            &next,
            &prev_pts,
            &mut next_pts,
            &mut status,
            &mut err,
            Size::new(self.window, self.window),
            self.max_level,
            criteria,
            0,
            self.min_eigen_threshold,
        )?;

        if next_pts.len() != points.len() || status.len() != points.len() {
            return Ok(MotionEstimate::default());
        }
        Ok(MotionEstimate {
            points: next_pts.iter().map(|p| Point2::new(p.x, p.y)).collect(),
            valid: status.iter().map(|s| s != 0).collect(),
        })
    }
}

impl MotionEstimator for LucasKanade {
    fn estimate(&self, prev: &GrayImage, next: &GrayImage, points: &[Point2]) -> MotionEstimate {
        if points.is_empty() || prev.width() == 0 || prev.height() == 0 || prev.dimensions() != next.dimensions() {
            return MotionEstimate::default();
        }
        self.try_estimate(prev, next, points).unwrap_or_else(|err| {
            warn!("optical flow failed: {err}");
            MotionEstimate::default()
        })
    }
}

/// `cv::goodFeaturesToTrack` on the detection box.
#[derive(Debug, Clone, Copy)]
pub struct ShiTomasi {
    pub max_corners: i32,
    /// Fraction of the strongest response a corner must reach.
    pub quality_level: f64,
    pub min_distance: f64,
    pub block_size: i32,
}

impl Default for ShiTomasi {
    fn default() -> Self {
        Self {
            max_corners: 100,
            quality_level: 0.3,
            min_distance: 7.0,
            block_size: 7,
        }
    }
}

impl ShiTomasi {
    fn try_extract(&self, image: &GrayImage, x: u32, y: u32, w: u32, h: u32) -> opencv::Result<Vec<Point2>> {
        let region = gray_mat(&imageops::crop_imm(image, x, y, w, h).to_image())?;
        let mut corners = Vector::<Point2f>::new();
        imgproc::good_features_to_track(
            &region,
            &mut corners,
            self.max_corners,
            self.quality_level,
            self.min_distance,
            &core::no_array(),
            self.block_size,
            false,
            0.04,
        )?;
        Ok(corners
            .iter()
            .map(|c| Point2::new(c.x + x as f32, c.y + y as f32))
            .collect())
    }
}

impl FeatureExtractor for ShiTomasi {
    fn extract(&self, image: &GrayImage, roi: &BoundingBox) -> Vec<Point2> {
        let Some(roi) = roi.clamp_to(image.width(), image.height()) else {
            return Vec::new();
        };
        let [x, y, w, h] = roi.to_pixels();
        if w < 3 || h < 3 || self.max_corners <= 0 {
            return Vec::new();
        }
        self.try_extract(image, x.max(0) as u32, y.max(0) as u32, w as u32, h as u32)
            .unwrap_or_else(|err| {
                warn!("corner detection failed: {err}");
                Vec::new()
            })
    }
}
