//! Per-camera tracking session.
//!
//! A session owns every tracker for one camera. Detection runs elsewhere and
//! comes back as a [`DetectionOutcome`] message which the owning thread applies
//! through [`CameraTrackingSession::apply_detection`], so the tracker list is
//! only ever touched from one thread.

use std::{sync::Arc, time::Instant};

use anyhow::{Result, anyhow};
use image::{GrayImage, imageops};
use metrics::gauge;
use ml_core::BoundingBox;
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::{
    annotation::{AnnotatedFrame, TrackSummary, annotate_frame},
    tracking::{FeatureExtractor, MotionEstimator, ObjectTracker, TrackerParams, TrackingBackend},
};

/// How tracker state survives a detection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum CarryOver {
    /// The first new tracker inherits the first previous tracker's state.
    #[default]
    First,
    /// Greedy IoU matching; each new tracker inherits from its best-overlapping
    /// previous tracker at or above `threshold`.
    Iou { threshold: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Submit every n-th frame for detection.
    pub detect_every: u64,
    pub confidence: f32,
    pub nms: f32,
    /// Gaussian blur applied before grayscale tracking; `0` disables it.
    pub blur_sigma: f32,
    pub carry_over: CarryOver,
    pub tracker: TrackerParams,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            detect_every: 15,
            confidence: 0.5,
            nms: 0.4,
            blur_sigma: 1.0,
            carry_over: CarryOver::First,
            tracker: TrackerParams::default(),
        }
    }
}

/// A raw frame handed off for detection.
#[derive(Debug)]
pub struct DetectionRequest {
    pub source_id: String,
    pub generation: u64,
    pub frame: Frame,
    pub confidence: f32,
    pub nms: f32,
}

/// Where sessions send detection work. Must not block.
pub trait DetectionRequester {
    /// Returns `false` when the request could not be queued.
    fn request(&self, request: DetectionRequest) -> bool;
}

/// Detection result routed back to the session that asked for it.
#[derive(Debug)]
pub struct DetectionOutcome {
    pub source_id: String,
    pub generation: u64,
    pub result: Result<Vec<BoundingBox>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Applied { trackers: usize },
    /// A newer detection has already been applied.
    Stale,
    Failed,
}

pub struct CameraTrackingSession {
    source_id: String,
    settings: SessionSettings,
    frame_counter: u64,
    trackers: Vec<ObjectTracker>,
    last_gray: Option<Arc<GrayImage>>,
    issued_generation: u64,
    applied_generation: u64,
    /// Set while the request for `issued_generation` has not come back.
    awaiting_detection: bool,
    estimator: Box<dyn MotionEstimator>,
    extractor: Box<dyn FeatureExtractor>,
}

impl CameraTrackingSession {
    pub fn new(source_id: impl Into<String>, settings: SessionSettings, backend: TrackingBackend) -> Self {
        let TrackingBackend { estimator, extractor } = backend;
        Self {
            source_id: source_id.into(),
            settings,
            frame_counter: 0,
            trackers: Vec::new(),
            last_gray: None,
            issued_generation: 0,
            applied_generation: 0,
            awaiting_detection: false,
            estimator,
            extractor,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn trackers(&self) -> &[ObjectTracker] {
        &self.trackers
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Whether the current frame count falls on the detection cadence.
    pub fn is_detection_frame(&self) -> bool {
        self.frame_counter % self.settings.detect_every.max(1) == 0
    }

    /// Whether a detection request is queued or running for this camera.
    pub fn awaiting_detection(&self) -> bool {
        self.awaiting_detection
    }

    pub fn process_frame(
        &mut self,
        frame: Frame,
        requester: &dyn DetectionRequester,
    ) -> Result<AnnotatedFrame> {
        self.process_frame_at(frame, requester, Instant::now())
    }

    /// Advance every tracker by one frame and annotate it. On cadence frames
    /// the raw frame is also handed to `requester` unless the previous request
    /// is still outstanding; tracking does not wait for the result.
    pub fn process_frame_at(
        &mut self,
        frame: Frame,
        requester: &dyn DetectionRequester,
        now: Instant,
    ) -> Result<AnnotatedFrame> {
        self.frame_counter += 1;
        let gray = self.prepare_gray(&frame)?;

        if self.is_detection_frame() {
            if self.awaiting_detection {
                debug!(
                    source = %self.source_id,
                    generation = self.issued_generation,
                    "previous detection still running; skipping this cycle"
                );
            } else {
                self.issued_generation += 1;
                self.awaiting_detection = requester.request(DetectionRequest {
                    source_id: self.source_id.clone(),
                    generation: self.issued_generation,
                    frame: frame.clone(),
                    confidence: self.settings.confidence,
                    nms: self.settings.nms,
                });
                if !self.awaiting_detection {
                    debug!(source = %self.source_id, "detection request not queued");
                }
            }
        }

        let params = self.settings.tracker;
        let estimator = self.estimator.as_ref();
        let before = self.trackers.len();
        self.trackers.retain_mut(|tracker| {
            tracker
                .update_at(gray.clone(), estimator, &params, now)
                .ok
        });
        if self.trackers.len() < before {
            debug!(
                source = %self.source_id,
                "dropped {} tracker(s) that lost their target",
                before - self.trackers.len()
            );
        }
        self.last_gray = Some(gray);

        let summaries = self
            .trackers
            .iter()
            .map(|tracker| TrackSummary::from_tracker(tracker, now))
            .collect();
        gauge!("camwatch_trackers", "source" => self.source_id.clone()).set(self.trackers.len() as f64);
        annotate_frame(&self.source_id, &frame, self.frame_counter, summaries)
    }

    pub fn apply_detection(&mut self, outcome: DetectionOutcome) -> Reconciliation {
        self.apply_detection_at(outcome, Instant::now())
    }

    /// Replace the tracker list with one tracker per detected box.
    pub fn apply_detection_at(&mut self, outcome: DetectionOutcome, now: Instant) -> Reconciliation {
        if outcome.generation == self.issued_generation {
            self.awaiting_detection = false;
        }
        if outcome.generation <= self.applied_generation {
            debug!(
                source = %self.source_id,
                generation = outcome.generation,
                applied = self.applied_generation,
                "discarding stale detection result"
            );
            return Reconciliation::Stale;
        }
        let boxes = match outcome.result {
            Ok(boxes) => boxes,
            Err(err) => {
                warn!(source = %self.source_id, "detection failed: {err:#}");
                return Reconciliation::Failed;
            }
        };
        self.applied_generation = outcome.generation;

        let previous = std::mem::take(&mut self.trackers);
        let Some(gray) = self.last_gray.clone() else {
            return Reconciliation::Applied { trackers: 0 };
        };

        let mut fresh: Vec<ObjectTracker> = boxes
            .into_iter()
            .map(|bbox| ObjectTracker::new(gray.clone(), bbox, self.extractor.as_ref()))
            .collect();
        match self.settings.carry_over {
            CarryOver::First => {
                if let (Some(new), Some(old)) = (fresh.first_mut(), previous.first()) {
                    new.inherit_from(old, now);
                }
            }
            CarryOver::Iou { threshold } => carry_over_by_iou(&mut fresh, &previous, threshold, now),
        }

        debug!(
            source = %self.source_id,
            generation = outcome.generation,
            "replaced {} tracker(s) with {}",
            previous.len(),
            fresh.len()
        );
        self.trackers = fresh;
        Reconciliation::Applied {
            trackers: self.trackers.len(),
        }
    }

    fn prepare_gray(&self, frame: &Frame) -> Result<Arc<GrayImage>> {
        let gray = frame
            .to_gray_image()
            .ok_or_else(|| anyhow!("frame from {} has an invalid buffer", self.source_id))?;
        let gray = if self.settings.blur_sigma > 0.0 {
            imageops::blur(&gray, self.settings.blur_sigma)
        } else {
            gray
        };
        Ok(Arc::new(gray))
    }
}

fn carry_over_by_iou(fresh: &mut [ObjectTracker], previous: &[ObjectTracker], threshold: f32, now: Instant) {
    let mut pairs = Vec::new();
    for (new_index, new) in fresh.iter().enumerate() {
        for (old_index, old) in previous.iter().enumerate() {
            let overlap = new.bbox().iou(&old.bbox());
            if overlap >= threshold && overlap > 0.0 {
                pairs.push((overlap, new_index, old_index));
            }
        }
    }
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut new_taken = vec![false; fresh.len()];
    let mut old_taken = vec![false; previous.len()];
    for (_, new_index, old_index) in pairs {
        if new_taken[new_index] || old_taken[old_index] {
            continue;
        }
        new_taken[new_index] = true;
        old_taken[old_index] = true;
        fresh[new_index].inherit_from(&previous[old_index], now);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{cell::RefCell, time::Duration};

    use super::*;
    use crate::tracking::{Point2, TrackState, tracker::tests::ScriptedMotion};

    /// Four points around the box centre.
    pub(crate) struct CentrePoints;

    /// Motionless flow seeded at the box centre.
    pub(crate) fn still_backend() -> TrackingBackend {
        TrackingBackend::new(Box::new(ScriptedMotion::constant(0.0, 0.0)), Box::new(CentrePoints))
    }

    impl FeatureExtractor for CentrePoints {
        fn extract(&self, _: &GrayImage, roi: &BoundingBox) -> Vec<Point2> {
            let (cx, cy) = roi.centroid();
            vec![
                Point2::new(cx - 2.0, cy - 2.0),
                Point2::new(cx + 2.0, cy - 2.0),
                Point2::new(cx - 2.0, cy + 2.0),
                Point2::new(cx + 2.0, cy + 2.0),
            ]
        }
    }

    #[derive(Default)]
    struct Recorder {
        requests: RefCell<Vec<DetectionRequest>>,
    }

    impl DetectionRequester for Recorder {
        fn request(&self, request: DetectionRequest) -> bool {
            self.requests.borrow_mut().push(request);
            true
        }
    }

    fn session(detect_every: u64, carry_over: CarryOver) -> CameraTrackingSession {
        let settings = SessionSettings {
            detect_every,
            blur_sigma: 0.0,
            carry_over,
            tracker: TrackerParams {
                smoothing: 0.5,
                ..TrackerParams::default()
            },
            ..SessionSettings::default()
        };
        CameraTrackingSession::new("cam-a", settings, still_backend())
    }

    fn frame() -> Frame {
        Frame::filled(64, 48, [40, 80, 120])
    }

    fn outcome(generation: u64, boxes: Vec<BoundingBox>) -> DetectionOutcome {
        DetectionOutcome {
            source_id: "cam-a".into(),
            generation,
            result: Ok(boxes),
        }
    }

    #[test]
    fn submits_every_nth_frame_with_increasing_generation() {
        let mut session = session(3, CarryOver::First);
        let recorder = Recorder::default();
        for _ in 0..3 {
            session.process_frame(frame(), &recorder).unwrap();
        }
        session.apply_detection(outcome(1, Vec::new()));
        for _ in 0..4 {
            session.process_frame(frame(), &recorder).unwrap();
        }
        let requests = recorder.requests.borrow();
        let generations: Vec<u64> = requests.iter().map(|r| r.generation).collect();
        assert_eq!(generations, vec![1, 2]);
        assert!(requests.iter().all(|r| r.source_id == "cam-a"));
        assert_eq!(requests[0].confidence, 0.5);
        assert_eq!(session.frame_counter(), 7);
    }

    #[test]
    fn one_request_in_flight_per_camera() {
        let mut session = session(2, CarryOver::First);
        let recorder = Recorder::default();
        for _ in 0..8 {
            session.process_frame(frame(), &recorder).unwrap();
        }
        assert_eq!(recorder.requests.borrow().len(), 1);
        assert!(session.awaiting_detection());

        // A failed detection still frees the slot for the next cadence frame.
        let failed = session.apply_detection(DetectionOutcome {
            source_id: "cam-a".into(),
            generation: 1,
            result: Err(anyhow!("model error")),
        });
        assert_eq!(failed, Reconciliation::Failed);
        assert!(!session.awaiting_detection());
        session.process_frame(frame(), &recorder).unwrap();
        session.process_frame(frame(), &recorder).unwrap();
        let generations: Vec<u64> = recorder.requests.borrow().iter().map(|r| r.generation).collect();
        assert_eq!(generations, vec![1, 2]);
        assert!(session.awaiting_detection());
    }

    #[test]
    fn rejected_request_does_not_block_the_next_cycle() {
        struct Refusing(RefCell<usize>);
        impl DetectionRequester for Refusing {
            fn request(&self, _: DetectionRequest) -> bool {
                *self.0.borrow_mut() += 1;
                false
            }
        }

        let mut session = session(2, CarryOver::First);
        let refusing = Refusing(RefCell::new(0));
        for _ in 0..6 {
            session.process_frame(frame(), &refusing).unwrap();
        }
        assert_eq!(*refusing.0.borrow(), 3);
        assert!(!session.awaiting_detection());
    }

    #[test]
    fn detection_before_any_frame_yields_no_trackers() {
        let mut session = session(1, CarryOver::First);
        let result = session.apply_detection(outcome(1, vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)]));
        assert_eq!(result, Reconciliation::Applied { trackers: 0 });
        assert!(session.trackers().is_empty());
    }

    #[test]
    fn trackers_keep_updating_while_detection_is_in_flight() {
        let mut session = session(2, CarryOver::First);
        let recorder = Recorder::default();
        session.process_frame(frame(), &recorder).unwrap();
        session.apply_detection(outcome(1, vec![BoundingBox::new(10.0, 10.0, 20.0, 20.0)]));
        assert_eq!(session.trackers().len(), 1);

        let annotated = session.process_frame(frame(), &recorder).unwrap();
        assert_eq!(recorder.requests.borrow().len(), 1);
        assert_eq!(annotated.tracks.len(), 1);
        assert_eq!(annotated.tracks[0].bbox, [10, 10, 20, 20]);
        assert_eq!(annotated.frame_number, 2);
    }

    #[test]
    fn first_new_tracker_inherits_stopped_state() {
        let mut session = session(1000, CarryOver::First);
        let recorder = Recorder::default();
        let t0 = Instant::now();
        session.process_frame_at(frame(), &recorder, t0).unwrap();
        session.apply_detection_at(outcome(1, vec![BoundingBox::new(10.0, 10.0, 20.0, 20.0)]), t0);
        for step in 1..=14u64 {
            session
                .process_frame_at(frame(), &recorder, t0 + Duration::from_millis(500 * step))
                .unwrap();
        }
        let old = &session.trackers()[0];
        assert_eq!(old.state(), TrackState::Stopped);
        let now = t0 + Duration::from_secs(7);
        let elapsed = old.motion().timer().elapsed_at(now);
        let old_id = old.id();

        let result = session.apply_detection_at(
            outcome(
                2,
                vec![
                    BoundingBox::new(30.0, 5.0, 10.0, 10.0),
                    BoundingBox::new(12.0, 12.0, 20.0, 20.0),
                ],
            ),
            now,
        );
        assert_eq!(result, Reconciliation::Applied { trackers: 2 });
        let trackers = session.trackers();
        assert_eq!(trackers[0].state(), TrackState::Stopped);
        assert!(trackers[0].motion().timer().elapsed_at(now) >= elapsed);
        assert!(elapsed > Duration::ZERO);
        assert_eq!(trackers[1].state(), TrackState::Moving);
        assert!(!trackers[1].motion().timer().is_running());
        assert!(trackers.iter().all(|t| t.id() != old_id));
    }

    #[test]
    fn iou_policy_matches_by_overlap() {
        let mut session = session(1000, CarryOver::Iou { threshold: 0.3 });
        let recorder = Recorder::default();
        let t0 = Instant::now();
        session.process_frame_at(frame(), &recorder, t0).unwrap();
        session.apply_detection_at(
            outcome(
                1,
                vec![
                    BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                    BoundingBox::new(40.0, 20.0, 10.0, 10.0),
                ],
            ),
            t0,
        );
        for step in 1..=14u64 {
            session
                .process_frame_at(frame(), &recorder, t0 + Duration::from_millis(500 * step))
                .unwrap();
        }
        assert!(session.trackers().iter().all(|t| t.is_stopped()));

        let now = t0 + Duration::from_secs(7);
        session.apply_detection_at(
            outcome(
                2,
                vec![
                    BoundingBox::new(30.0, 30.0, 10.0, 10.0),
                    BoundingBox::new(41.0, 21.0, 10.0, 10.0),
                ],
            ),
            now,
        );
        let trackers = session.trackers();
        assert_eq!(trackers[0].state(), TrackState::Moving);
        assert_eq!(trackers[1].state(), TrackState::Stopped);
    }

    #[test]
    fn stale_and_failed_results_leave_trackers_alone() {
        let mut session = session(1000, CarryOver::First);
        let recorder = Recorder::default();
        session.process_frame(frame(), &recorder).unwrap();
        session.apply_detection(outcome(2, vec![BoundingBox::new(5.0, 5.0, 10.0, 10.0)]));
        assert_eq!(session.trackers().len(), 1);

        let stale = session.apply_detection(outcome(1, Vec::new()));
        assert_eq!(stale, Reconciliation::Stale);
        assert_eq!(session.trackers().len(), 1);

        let failed = session.apply_detection(DetectionOutcome {
            source_id: "cam-a".into(),
            generation: 3,
            result: Err(anyhow!("model error")),
        });
        assert_eq!(failed, Reconciliation::Failed);
        assert_eq!(session.trackers().len(), 1);
    }

    #[test]
    fn empty_detection_clears_trackers() {
        let mut session = session(1000, CarryOver::First);
        let recorder = Recorder::default();
        session.process_frame(frame(), &recorder).unwrap();
        session.apply_detection(outcome(1, vec![BoundingBox::new(5.0, 5.0, 10.0, 10.0)]));
        let result = session.apply_detection(outcome(2, Vec::new()));
        assert_eq!(result, Reconciliation::Applied { trackers: 0 });
        assert!(session.trackers().is_empty());
    }

    #[test]
    fn blur_is_applied_before_tracking() {
        let settings = SessionSettings {
            blur_sigma: 1.5,
            ..SessionSettings::default()
        };
        let session = CameraTrackingSession::new("cam-b", settings, still_backend());
        let gray = session.prepare_gray(&frame()).unwrap();
        assert_eq!(gray.dimensions(), (64, 48));
    }
}
