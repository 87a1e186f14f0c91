//! Runtime wiring: configuration, telemetry, the renderer seam, and the
//! orchestrator that drives every camera session.

pub mod config;
pub mod orchestrator;
pub mod sink;
pub mod telemetry;

pub use config::{CarryOverArg, PipelineArgs, PipelineConfig, TelemetryOptions};
pub use orchestrator::{PipelineOrchestrator, ShutdownReport};
pub use sink::{FrameSink, NullSink};
