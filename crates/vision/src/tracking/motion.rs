//! Sparse motion estimation between consecutive grayscale frames.

use image::GrayImage;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// New positions for the input points plus a per-point validity flag.
///
/// Both vectors are either empty ("nothing to estimate") or the same length
/// as the input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionEstimate {
    pub points: Vec<Point2>,
    pub valid: Vec<bool>,
}

impl MotionEstimate {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

pub trait MotionEstimator: Send {
    fn estimate(&self, prev: &GrayImage, next: &GrayImage, points: &[Point2]) -> MotionEstimate;
}

/// Median of `values`; averages the middle pair for even lengths.
pub fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f32::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
