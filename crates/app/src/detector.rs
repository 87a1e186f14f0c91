//! Builds the per-worker detector factory for the configured backend.

use anyhow::Result;
use ml_core::DetectorFactory;
use vision::PipelineConfig;

#[cfg(feature = "with-tch")]
pub fn detector_factory(config: &PipelineConfig, use_cpu: bool) -> Result<DetectorFactory> {
    use std::sync::Arc;

    use anyhow::{Context, anyhow};
    use ml_core::{Detector, TorchDetector, tch::Device};
    use tracing::info;

    let model = config
        .model_path
        .clone()
        .ok_or_else(|| anyhow!("--model is required to run the detector"))?;
    let size = i64::from(config.detector_size);
    Ok(Arc::new(move |worker: usize| {
        let device = if use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available()
        };
        let detector = TorchDetector::new(&model, device, (size, size))
            .with_context(|| format!("failed to load detector model {}", model.display()))?;
        info!(worker, ?device, "detector loaded");
        Ok(Box::new(detector) as Box<dyn Detector>)
    }))
}

#[cfg(not(feature = "with-tch"))]
pub fn detector_factory(_config: &PipelineConfig, _use_cpu: bool) -> Result<DetectorFactory> {
    anyhow::bail!("camwatch was built without a detector backend; rebuild with `--features with-tch`")
}
