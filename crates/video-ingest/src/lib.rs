//! Camera ingestion for the tracking pipeline.
//!
//! One [`StreamIngestor`] per camera runs on its own thread, reconnecting on
//! failure and pushing resized frames into a shared [`FrameChannel`]. The
//! channel is bounded and drops the newest frame when full, which is the
//! pipeline's only admission control.

mod cancel;
mod channel;
mod ffmpeg;
mod ingestor;
mod source;
mod thread;
mod types;

pub use cancel::CancellationToken;
pub use channel::{FrameChannel, FrameProducer, Pop, PushError};
pub use ffmpeg::FfmpegSource;
pub use ingestor::{IngestStats, IngestorHandle, IngestorSettings, SourcedFrame, StreamIngestor};
pub use source::FrameSource;
pub use thread::{join_with_timeout, spawn_thread};
pub use types::{CaptureError, Frame, FrameFormat};
