//! Single-object optical-flow tracker with a stopped/moving state machine.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use image::GrayImage;
use ml_core::BoundingBox;
use serde::Serialize;
use tracing::trace;

use super::{
    features::FeatureExtractor,
    history::{DISPLACEMENT_WINDOW, PositionHistory},
    motion::{MotionEstimator, Point2, median},
    timer::MovementTimer,
};

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    #[default]
    Moving,
    Stopped,
}

/// Thresholds for motion smoothing and the stop/breakout hysteresis.
///
/// `breakout_px` must be greater than `stop_px`; configuration validation
/// enforces this before any tracker is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerParams {
    pub stop_px: f32,
    pub breakout_px: f32,
    pub stop_duration: Duration,
    /// Weight kept by the current position each update, in `(0, 1)`.
    pub smoothing: f32,
    pub window: Duration,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            stop_px: 10.0,
            breakout_px: 25.0,
            stop_duration: Duration::from_secs(5),
            smoothing: 0.6,
            window: DISPLACEMENT_WINDOW,
        }
    }
}

/// Stop/move decision for one tracked object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionState {
    state: TrackState,
    timer: MovementTimer,
}

impl MotionState {
    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn timer(&self) -> &MovementTimer {
        &self.timer
    }

    /// Feed the windowed displacement observed at `now`.
    pub fn observe(&mut self, displacement: f32, params: &TrackerParams, now: Instant) -> TrackState {
        match self.state {
            TrackState::Moving if displacement < params.stop_px => {
                self.timer.start_if_idle_at(now);
                if self.timer.has_exceeded_at(params.stop_duration, now) {
                    self.state = TrackState::Stopped;
                }
            }
            TrackState::Moving => self.timer.reset(),
            TrackState::Stopped if displacement > params.breakout_px => {
                self.state = TrackState::Moving;
                self.timer.reset();
            }
            TrackState::Stopped => {}
        }
        self.state
    }

    /// Take over another object's state, keeping its timer reading continuous.
    pub fn inherit(&mut self, prior: &MotionState, now: Instant) {
        self.state = prior.state;
        if prior.timer.is_running() {
            self.timer.reload_from_at(prior.timer.elapsed_at(now), now);
        } else {
            self.timer.reset();
        }
    }
}

/// Result of one tracker update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackUpdate {
    pub ok: bool,
    pub bbox: BoundingBox,
    pub stopped: bool,
}

pub struct ObjectTracker {
    id: u64,
    bbox: BoundingBox,
    /// Unsmoothed box following the median point motion; `bbox` eases toward it.
    target: BoundingBox,
    points: Vec<Point2>,
    last_gray: Arc<GrayImage>,
    history: PositionHistory,
    motion: MotionState,
}

impl ObjectTracker {
    /// Start tracking `bbox`, seeding feature points from `gray`.
    pub fn new(gray: Arc<GrayImage>, bbox: BoundingBox, extractor: &dyn FeatureExtractor) -> Self {
        let points = extractor.extract(&gray, &bbox);
        Self::with_points(gray, bbox, points)
    }

    pub fn with_points(gray: Arc<GrayImage>, bbox: BoundingBox, points: Vec<Point2>) -> Self {
        Self {
            id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
            bbox,
            target: bbox,
            points,
            last_gray: gray,
            history: PositionHistory::default(),
            motion: MotionState::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn points(&self) -> &[Point2] {
        &self.points
    }

    pub fn state(&self) -> TrackState {
        self.motion.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.motion.state() == TrackState::Stopped
    }

    pub fn motion(&self) -> &MotionState {
        &self.motion
    }

    /// Seconds on the stop timer while stopped, otherwise zero.
    pub fn stopped_secs_at(&self, now: Instant) -> f32 {
        if self.is_stopped() {
            self.motion.timer().elapsed_secs_at(now)
        } else {
            0.0
        }
    }

    pub fn inherit_from(&mut self, prior: &ObjectTracker, now: Instant) {
        self.motion.inherit(&prior.motion, now);
    }

    pub fn update(
        &mut self,
        gray: Arc<GrayImage>,
        estimator: &dyn MotionEstimator,
        params: &TrackerParams,
    ) -> TrackUpdate {
        self.update_at(gray, estimator, params, Instant::now())
    }

    pub fn update_at(
        &mut self,
        gray: Arc<GrayImage>,
        estimator: &dyn MotionEstimator,
        params: &TrackerParams,
        now: Instant,
    ) -> TrackUpdate {
        if self.points.is_empty() {
            self.last_gray = gray;
            return self.snapshot();
        }

        let estimate = estimator.estimate(&self.last_gray, &gray, &self.points);
        self.last_gray = gray;
        if estimate.is_empty() {
            trace!(track = self.id, "no motion estimate; holding position");
            return self.snapshot();
        }

        let mut dxs = Vec::with_capacity(self.points.len());
        let mut dys = Vec::with_capacity(self.points.len());
        let mut kept = Vec::with_capacity(self.points.len());
        for ((old, new), valid) in self.points.iter().zip(&estimate.points).zip(&estimate.valid) {
            if *valid {
                dxs.push(new.x - old.x);
                dys.push(new.y - old.y);
                kept.push(*new);
            }
        }
        self.points = kept;

        if dxs.len() >= 2 {
            if let (Some(dx), Some(dy)) = (median(&mut dxs), median(&mut dys)) {
                self.target = self.target.shift(dx, dy);
            }
        }

        let f = params.smoothing;
        self.bbox = self.bbox.with_origin(
            self.bbox.x * f + self.target.x * (1.0 - f),
            self.bbox.y * f + self.target.y * (1.0 - f),
        );

        self.history.push(now, self.bbox.centroid());
        if let Some(displacement) = self.history.displacement(params.window) {
            let before = self.motion.state();
            let after = self.motion.observe(displacement, params, now);
            if before != after {
                trace!(track = self.id, ?before, ?after, displacement, "track state changed");
            }
        }
        self.snapshot()
    }

    fn snapshot(&self) -> TrackUpdate {
        TrackUpdate {
            ok: true,
            bbox: self.bbox,
            stopped: self.is_stopped(),
        }
    }
}

impl std::fmt::Debug for ObjectTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTracker")
            .field("id", &self.id)
            .field("bbox", &self.bbox)
            .field("points", &self.points.len())
            .field("state", &self.motion.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use image::Luma;

    use super::*;
    use crate::tracking::motion::MotionEstimate;

    /// Moves every point by a scripted offset; invalid indices are flagged.
    #[derive(Default)]
    pub(crate) struct ScriptedMotion {
        pub(crate) offsets: Mutex<Vec<(f32, f32)>>,
        pub(crate) invalid: Vec<usize>,
        pub(crate) override_points: Option<Vec<(f32, f32)>>,
    }

    impl ScriptedMotion {
        pub(crate) fn constant(dx: f32, dy: f32) -> Self {
            Self {
                offsets: Mutex::new(vec![(dx, dy)]),
                ..Self::default()
            }
        }

        pub(crate) fn set(&self, dx: f32, dy: f32) {
            *self.offsets.lock().unwrap() = vec![(dx, dy)];
        }
    }

    impl MotionEstimator for ScriptedMotion {
        fn estimate(&self, _: &GrayImage, _: &GrayImage, points: &[Point2]) -> MotionEstimate {
            if let Some(deltas) = &self.override_points {
                return MotionEstimate {
                    points: points
                        .iter()
                        .zip(deltas)
                        .map(|(p, (dx, dy))| Point2::new(p.x + dx, p.y + dy))
                        .collect(),
                    valid: vec![true; points.len()],
                };
            }
            let (dx, dy) = self.offsets.lock().unwrap().first().copied().unwrap_or_default();
            MotionEstimate {
                points: points.iter().map(|p| Point2::new(p.x + dx, p.y + dy)).collect(),
                valid: (0..points.len()).map(|i| !self.invalid.contains(&i)).collect(),
            }
        }
    }

    struct NoEstimate;

    impl MotionEstimator for NoEstimate {
        fn estimate(&self, _: &GrayImage, _: &GrayImage, _: &[Point2]) -> MotionEstimate {
            MotionEstimate::default()
        }
    }

    pub(crate) fn blank() -> Arc<GrayImage> {
        Arc::new(GrayImage::from_pixel(64, 64, Luma([0])))
    }

    fn tracker_with_points(n: usize) -> ObjectTracker {
        let points = (0..n).map(|i| Point2::new(10.0 + i as f32, 10.0)).collect();
        ObjectTracker::with_points(blank(), BoundingBox::new(0.0, 0.0, 20.0, 40.0), points)
    }

    fn params() -> TrackerParams {
        TrackerParams {
            stop_px: 10.0,
            breakout_px: 25.0,
            stop_duration: Duration::from_secs(5),
            smoothing: 0.5,
            window: DISPLACEMENT_WINDOW,
        }
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = tracker_with_points(0);
        let b = tracker_with_points(0);
        assert!(b.id() > a.id());
    }

    #[test]
    fn without_points_position_is_held() {
        let mut tracker = tracker_with_points(0);
        let update = tracker.update(blank(), &ScriptedMotion::constant(5.0, 5.0), &params());
        assert!(update.ok);
        assert_eq!(update.bbox, BoundingBox::new(0.0, 0.0, 20.0, 40.0));
        assert!(!update.stopped);
    }

    #[test]
    fn empty_estimate_holds_position_and_keeps_points() {
        let mut tracker = tracker_with_points(4);
        let update = tracker.update(blank(), &NoEstimate, &params());
        assert!(update.ok);
        assert_eq!(update.bbox, BoundingBox::new(0.0, 0.0, 20.0, 40.0));
        assert_eq!(tracker.points().len(), 4);
    }

    #[test]
    fn invalid_points_are_dropped() {
        let mut tracker = tracker_with_points(4);
        let motion = ScriptedMotion {
            offsets: Mutex::new(vec![(1.0, 0.0)]),
            invalid: vec![0, 2],
            override_points: None,
        };
        tracker.update(blank(), &motion, &params());
        assert_eq!(tracker.points(), &[Point2::new(12.0, 10.0), Point2::new(14.0, 10.0)]);
    }

    #[test]
    fn single_valid_point_does_not_move_the_box() {
        let mut tracker = tracker_with_points(3);
        let motion = ScriptedMotion {
            offsets: Mutex::new(vec![(8.0, 8.0)]),
            invalid: vec![0, 1],
            override_points: None,
        };
        let update = tracker.update(blank(), &motion, &params());
        assert_eq!(update.bbox, BoundingBox::new(0.0, 0.0, 20.0, 40.0));
        assert_eq!(tracker.points().len(), 1);
    }

    #[test]
    fn shift_uses_median_not_mean() {
        let mut tracker = tracker_with_points(5);
        let motion = ScriptedMotion {
            override_points: Some(vec![(1.0, 2.0), (1.0, 2.0), (1.0, 2.0), (1.0, 2.0), (400.0, -300.0)]),
            ..ScriptedMotion::default()
        };
        let p = TrackerParams {
            smoothing: 0.5,
            ..params()
        };
        tracker.update(blank(), &motion, &p);
        assert_eq!(tracker.target, BoundingBox::new(1.0, 2.0, 20.0, 40.0));
        assert_eq!(tracker.bbox(), BoundingBox::new(0.5, 1.0, 20.0, 40.0));
    }

    #[test]
    fn smoothing_converges_geometrically_without_overshoot() {
        let mut tracker = tracker_with_points(4);
        let motion = ScriptedMotion::constant(12.0, 0.0);
        let p = TrackerParams {
            smoothing: 0.75,
            ..params()
        };
        tracker.update(blank(), &motion, &p);
        motion.set(0.0, 0.0);

        let mut gap = 12.0 - tracker.bbox().x;
        assert!((gap - 12.0 * 0.75).abs() < 1e-4);
        for _ in 0..10 {
            tracker.update(blank(), &motion, &p);
            let next_gap = 12.0 - tracker.bbox().x;
            assert!(next_gap >= 0.0, "overshoot");
            assert!((next_gap - gap * 0.75).abs() < 1e-4);
            gap = next_gap;
        }
        assert_eq!(tracker.bbox().width, 20.0);
        assert_eq!(tracker.bbox().height, 40.0);
    }

    #[test]
    fn stops_just_after_the_stop_duration() {
        let p = params();
        let t0 = Instant::now();
        let mut state = MotionState::default();
        assert_eq!(state.observe(2.0, &p, t0), TrackState::Moving);
        assert_eq!(state.observe(2.0, &p, t0 + p.stop_duration), TrackState::Moving);
        assert_eq!(
            state.observe(2.0, &p, t0 + p.stop_duration + Duration::from_millis(1)),
            TrackState::Stopped
        );
    }

    #[test]
    fn movement_while_moving_cancels_stop_candidacy() {
        let p = params();
        let t0 = Instant::now();
        let mut state = MotionState::default();
        state.observe(2.0, &p, t0);
        state.observe(10.0, &p, t0 + Duration::from_secs(3));
        assert!(!state.timer().is_running());
        state.observe(2.0, &p, t0 + Duration::from_secs(4));
        assert_eq!(
            state.observe(2.0, &p, t0 + Duration::from_secs(6)),
            TrackState::Moving
        );
    }

    #[test]
    fn breakout_needs_more_than_the_breakout_threshold() {
        let p = params();
        let t0 = Instant::now();
        let mut state = MotionState::default();
        state.observe(0.0, &p, t0);
        state.observe(0.0, &p, t0 + Duration::from_secs(6));
        assert_eq!(state.state(), TrackState::Stopped);

        let eps = 0.01;
        let t1 = t0 + Duration::from_secs(7);
        assert_eq!(state.observe(p.breakout_px - eps, &p, t1), TrackState::Stopped);
        assert_eq!(state.observe(p.stop_px + 1.0, &p, t1), TrackState::Stopped);
        assert_eq!(state.observe(p.breakout_px + eps, &p, t1), TrackState::Moving);
        assert!(!state.timer().is_running());
    }

    #[test]
    fn stationary_tracker_stops_through_updates() {
        let p = params();
        let t0 = Instant::now();
        let mut tracker = tracker_with_points(3);
        let still = ScriptedMotion::constant(0.0, 0.0);
        let mut last = tracker.update_at(blank(), &still, &p, t0);
        for step in 1..=12 {
            last = tracker.update_at(blank(), &still, &p, t0 + Duration::from_millis(500 * step));
        }
        assert!(last.stopped);
        assert_eq!(tracker.state(), TrackState::Stopped);
        assert!(tracker.stopped_secs_at(t0 + Duration::from_secs(6)) >= 5.5);
    }

    #[test]
    fn inherit_carries_state_and_elapsed_time() {
        let p = params();
        let t0 = Instant::now();
        let mut prior = tracker_with_points(0);
        prior.motion.observe(0.0, &p, t0);
        prior.motion.observe(0.0, &p, t0 + Duration::from_secs(8));
        assert!(prior.is_stopped());

        let now = t0 + Duration::from_secs(9);
        let mut fresh = tracker_with_points(0);
        fresh.inherit_from(&prior, now);
        assert!(fresh.is_stopped());
        assert!(fresh.motion().timer().elapsed_at(now) >= Duration::from_secs(9));
        assert_ne!(fresh.id(), prior.id());
    }

    #[test]
    fn inheriting_an_idle_timer_leaves_it_idle() {
        let prior = tracker_with_points(0);
        let mut fresh = tracker_with_points(0);
        fresh.motion.observe(0.0, &params(), Instant::now());
        fresh.inherit_from(&prior, Instant::now());
        assert!(!fresh.motion().timer().is_running());
        assert_eq!(fresh.state(), TrackState::Moving);
    }
}
