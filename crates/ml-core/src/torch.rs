//! TorchScript person detector.
//!
//! Expects a YOLO-style export producing `[1, 4 + classes, predictions]`,
//! where the first four channels are centre-x, centre-y, width and height in
//! model input pixels and the remaining channels are per-class scores.

use std::{convert::TryFrom, path::Path};

use anyhow::{Result, bail};
use tch::{Device, Kind, Tensor};
use tracing::debug;
use video_ingest::Frame;

use crate::{
    detector::{Detector, ScoredBox, non_max_suppression},
    geometry::BoundingBox,
};

/// COCO index of the `person` class.
pub const PERSON_CLASS_ID: usize = 0;

const MAX_CANDIDATES: usize = 512;

pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    class_id: usize,
}

impl TorchDetector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(model_path: P, device: Device, input_size: (i64, i64)) -> Result<Self> {
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            class_id: PERSON_CLASS_ID,
        })
    }

    /// Scale the frame to the model input and build a normalised NCHW RGB tensor.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor> {
        let (in_w, in_h) = self.input_size;
        let scaled = frame.clone().resized(in_w as i32, in_h as i32)?;
        let Some(rgb) = scaled.to_rgb_image() else {
            bail!("frame buffer does not match {}x{}", scaled.width, scaled.height);
        };
        let tensor = Tensor::from_slice(rgb.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .permute([0, 3, 1, 2])
            / 255.0;
        Ok(tensor)
    }

    fn candidates(&self, output: &Tensor, frame: &Frame, confidence: f32) -> Result<Vec<ScoredBox>> {
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        let channels = shape[1] as usize;
        if channels <= 4 + self.class_id {
            bail!("detector output has {channels} channels, class {} is out of range", self.class_id);
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let sx = frame.width as f32 / self.input_size.0 as f32;
        let sy = frame.height as f32 / self.input_size.1 as f32;
        let mut candidates = Vec::new();
        for row in rows {
            let scores = &row[4..];
            let Some((best, &score)) = scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
            else {
                continue;
            };
            if best != self.class_id || score <= confidence {
                continue;
            }
            candidates.push(ScoredBox {
                bbox: BoundingBox::from_center(row[0] * sx, row[1] * sy, row[2] * sx, row[3] * sy),
                score,
            });
            if candidates.len() >= MAX_CANDIDATES {
                break;
            }
        }
        Ok(candidates)
    }
}

impl Detector for TorchDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<BoundingBox>> {
        let input = self.frame_to_tensor(frame)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        let candidates = self.candidates(&output, frame, confidence_threshold)?;
        let raw = candidates.len();
        let kept = non_max_suppression(candidates, confidence_threshold, nms_threshold);
        debug!("torch detector kept {} of {raw} candidate(s)", kept.len());
        Ok(kept.into_iter().map(|k| k.bbox).collect())
    }
}
