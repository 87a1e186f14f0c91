use anyhow::Result;

use crate::annotation::AnnotatedFrame;

/// Renderer seam: receives every annotated frame and may ask the pipeline to stop.
///
/// Sinks own no pipeline state. An error from `show` is logged by the
/// orchestrator and never ends the run.
pub trait FrameSink {
    fn show(&mut self, frame: AnnotatedFrame) -> Result<()>;

    /// Polled once per loop iteration.
    fn shutdown_requested(&self) -> bool {
        false
    }

    /// Called once after the loop exits.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn show(&mut self, frame: AnnotatedFrame) -> Result<()> {
        (**self).show(frame)
    }

    fn shutdown_requested(&self) -> bool {
        (**self).shutdown_requested()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Discards frames. Useful for headless runs that only export metrics.
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn show(&mut self, _frame: AnnotatedFrame) -> Result<()> {
        Ok(())
    }
}
