//! Per-camera tracking for the multi-camera pipeline.
//!
//! Frames arrive from [`video_ingest`] ingestors, are routed to a
//! [`CameraTrackingSession`] per camera, and leave as [`AnnotatedFrame`]s.
//! Person detection runs on the [`ml_core`] worker pool; its results are
//! applied back on the orchestrator thread.

pub mod annotation;
pub mod pipeline;
pub mod session;
pub mod tracking;

pub use annotation::{AnnotatedFrame, TrackSummary, annotate_frame};
pub use pipeline::{
    FrameSink, NullSink, PipelineArgs, PipelineConfig, PipelineOrchestrator, ShutdownReport,
};
pub use session::{
    CameraTrackingSession, CarryOver, DetectionOutcome, DetectionRequest, DetectionRequester,
    Reconciliation, SessionSettings,
};
pub use tracking::{ObjectTracker, TrackState, TrackerParams};
