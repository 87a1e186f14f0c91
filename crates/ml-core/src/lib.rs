//! Detection side of the pipeline: box geometry, the [`Detector`] seam, and
//! the [`DetectionDispatcher`] worker pool. A TorchScript detector is
//! available behind the `with-tch` feature.

pub mod detector;
pub mod dispatcher;
pub mod geometry;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use detector::{Detector, DetectorFactory, FnDetector, ScoredBox, non_max_suppression};
pub use dispatcher::{Completion, DetectionDispatcher, DispatchError};
pub use geometry::BoundingBox;

#[cfg(feature = "with-tch")]
pub use tch;
#[cfg(feature = "with-tch")]
pub use torch::TorchDetector;
