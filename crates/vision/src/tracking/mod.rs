//! Per-object tracking: feature seeding, sparse optical flow, and the
//! stopped/moving state machine.

#[cfg(feature = "with-opencv")]
pub mod cv;
pub mod features;
pub mod history;
pub mod motion;
pub mod timer;
pub mod tracker;

#[cfg(feature = "with-opencv")]
pub use cv::{LucasKanade, ShiTomasi};
pub use features::FeatureExtractor;
pub use history::{DISPLACEMENT_WINDOW, HISTORY_CAPACITY, PositionHistory};
pub use motion::{MotionEstimate, MotionEstimator, Point2, median};
pub use timer::MovementTimer;
pub use tracker::{MotionState, ObjectTracker, TrackState, TrackUpdate, TrackerParams};

/// Builds a fresh backend for each registered camera.
pub type TrackingFactory = std::sync::Arc<dyn Fn() -> anyhow::Result<TrackingBackend> + Send + Sync>;

/// Flow estimator and corner extractor owned by one camera session.
pub struct TrackingBackend {
    pub estimator: Box<dyn MotionEstimator>,
    pub extractor: Box<dyn FeatureExtractor>,
}

impl TrackingBackend {
    pub fn new(estimator: Box<dyn MotionEstimator>, extractor: Box<dyn FeatureExtractor>) -> Self {
        Self { estimator, extractor }
    }

    /// Lucas-Kanade flow seeded by Shi-Tomasi corners.
    #[cfg(feature = "with-opencv")]
    pub fn from_build() -> anyhow::Result<Self> {
        Ok(Self::new(Box::new(LucasKanade::default()), Box::new(ShiTomasi::default())))
    }

    #[cfg(not(feature = "with-opencv"))]
    pub fn from_build() -> anyhow::Result<Self> {
        anyhow::bail!(
            "optical-flow tracking needs OpenCV; rebuild with `--features with-opencv`"
        )
    }
}
