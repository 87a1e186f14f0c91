//! The detector seam used by detection workers.

use std::{cmp::Ordering, sync::Arc};

use anyhow::Result;
use video_ingest::Frame;

use crate::geometry::BoundingBox;

/// Person detector owned by exactly one worker.
///
/// `detect` takes `&mut self` so implementations may keep scratch buffers,
/// but results must depend only on the inputs.
pub trait Detector: Send {
    fn detect(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<BoundingBox>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<BoundingBox>> {
        (**self).detect(frame, confidence_threshold, nms_threshold)
    }
}

/// Builds one detector per worker. Called once on the worker thread at
/// startup with the worker index.
pub type DetectorFactory = Arc<dyn Fn(usize) -> Result<Box<dyn Detector>> + Send + Sync>;

/// Adapts a plain function into a [`Detector`].
pub struct FnDetector<F>(F);

impl<F> FnDetector<F>
where
    F: FnMut(&Frame, f32, f32) -> Result<Vec<BoundingBox>> + Send,
{
    pub fn new(detect: F) -> Self {
        Self(detect)
    }
}

impl<F> Detector for FnDetector<F>
where
    F: FnMut(&Frame, f32, f32) -> Result<Vec<BoundingBox>> + Send,
{
    fn detect(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<BoundingBox>> {
        (self.0)(frame, confidence_threshold, nms_threshold)
    }
}

/// Candidate box with its detector score, before suppression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBox {
    pub bbox: BoundingBox,
    pub score: f32,
}

/// Greedy non-maximum suppression.
///
/// Candidates below `score_threshold` are discarded, the rest are visited in
/// descending score order and a box is kept unless it overlaps an already
/// kept box by more than `iou_threshold`.
pub fn non_max_suppression(
    mut candidates: Vec<ScoredBox>,
    score_threshold: f32,
    iou_threshold: f32,
) -> Vec<ScoredBox> {
    candidates.retain(|c| c.score > score_threshold);
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<ScoredBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}
