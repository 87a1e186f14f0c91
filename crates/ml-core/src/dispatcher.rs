//! Fixed pool of detection workers shared by every camera.
//!
//! Each worker builds its own detector once at startup and then serves jobs
//! from a shared unbounded queue, so `submit` never blocks the caller. The
//! completion callback runs on the worker thread; callers are expected to
//! forward the result onto their own thread rather than mutate shared state.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use video_ingest::{CancellationToken, Frame, join_with_timeout, spawn_thread};

use crate::{
    detector::{Detector, DetectorFactory},
    geometry::BoundingBox,
};

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Called exactly once per completed job, on the worker thread.
pub type Completion = Box<dyn FnOnce(Result<Vec<BoundingBox>>) + Send + 'static>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("detection pool needs at least one worker")]
    NoWorkers,
    #[error("failed to spawn detector worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("detector worker #{worker} failed to initialise: {message}")]
    WorkerInit { worker: usize, message: String },
    #[error("detection pool is shut down")]
    Closed,
}

/// Readiness report sent by each worker once its detector is built.
type WorkerInit = std::result::Result<String, (usize, String)>;

struct DetectionJob {
    frame: Frame,
    confidence: f32,
    nms: f32,
    submitted_at: Instant,
    on_complete: Completion,
}

pub struct DetectionDispatcher {
    job_tx: Option<Sender<DetectionJob>>,
    workers: Vec<thread::JoinHandle<()>>,
    token: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl DetectionDispatcher {
    /// Spawn `workers` threads and wait until every detector has loaded.
    ///
    /// If any worker fails to build its detector the whole pool is torn down
    /// and the first failure is returned.
    pub fn start(workers: usize, factory: DetectorFactory) -> Result<Self, DispatchError> {
        if workers == 0 {
            return Err(DispatchError::NoWorkers);
        }

        let token = CancellationToken::new();
        let pending = Arc::new(AtomicUsize::new(0));
        let (job_tx, job_rx) = unbounded::<DetectionJob>();
        let (init_tx, init_rx) = crossbeam_channel::bounded::<WorkerInit>(workers);

        let mut dispatcher = Self {
            job_tx: Some(job_tx),
            workers: Vec::with_capacity(workers),
            token: token.clone(),
            pending: pending.clone(),
        };

        for worker_index in 0..workers {
            let worker = DetectorWorker {
                index: worker_index,
                jobs: job_rx.clone(),
                token: token.clone(),
                pending: pending.clone(),
            };
            let worker_factory = factory.clone();
            let worker_init_tx = init_tx.clone();
            let handle = spawn_thread(format!("detector-{worker_index}"), move || {
                worker.run(worker_factory, worker_init_tx)
            });
            match handle {
                Ok(handle) => dispatcher.workers.push(handle),
                Err(err) => {
                    dispatcher.shutdown(Duration::from_secs(1));
                    return Err(DispatchError::Spawn(err));
                }
            }
        }
        drop(init_tx);
        drop(job_rx);

        for _ in 0..workers {
            match init_rx.recv() {
                Ok(Ok(message)) => debug!("{message}"),
                Ok(Err((worker, message))) => {
                    dispatcher.shutdown(Duration::from_secs(1));
                    return Err(DispatchError::WorkerInit { worker, message });
                }
                Err(_) => {
                    dispatcher.shutdown(Duration::from_secs(1));
                    return Err(DispatchError::WorkerInit {
                        worker: 0,
                        message: "detector worker exited before reporting readiness".into(),
                    });
                }
            }
        }

        info!("detection pool ready with {workers} worker(s)");
        Ok(dispatcher)
    }

    /// Queue `frame` for detection. Returns immediately.
    pub fn submit<F>(
        &self,
        frame: Frame,
        confidence: f32,
        nms: f32,
        on_complete: F,
    ) -> Result<(), DispatchError>
    where
        F: FnOnce(Result<Vec<BoundingBox>>) + Send + 'static,
    {
        let job_tx = self.job_tx.as_ref().ok_or(DispatchError::Closed)?;
        if self.token.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        let job = DetectionJob {
            frame,
            confidence,
            nms,
            submitted_at: Instant::now(),
            on_complete: Box::new(on_complete),
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if job_tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::Closed);
        }
        counter!("camwatch_detections_submitted_total").increment(1);
        gauge!("camwatch_detections_pending").set(self.pending() as f64);
        Ok(())
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.job_tx.is_none()
    }

    /// Stop accepting jobs, abandon anything still queued, and join each
    /// worker for at most `timeout`. Returns the number of workers that were
    /// abandoned because they did not stop in time.
    pub fn shutdown(&mut self, timeout: Duration) -> usize {
        self.token.cancel();
        self.job_tx = None;
        let mut abandoned = 0;
        for handle in self.workers.drain(..) {
            match join_with_timeout(handle, timeout) {
                Some(Ok(())) => {}
                Some(Err(_)) => warn!("detector worker panicked during shutdown"),
                None => abandoned += 1,
            }
        }
        if abandoned > 0 {
            warn!("{abandoned} detector worker(s) abandoned at shutdown");
        }
        abandoned
    }
}

impl Drop for DetectionDispatcher {
    fn drop(&mut self) {
        self.token.cancel();
        self.job_tx = None;
    }
}

struct DetectorWorker {
    index: usize,
    jobs: Receiver<DetectionJob>,
    token: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl DetectorWorker {
    fn run(self, factory: DetectorFactory, init_tx: Sender<WorkerInit>) {
        let mut detector = match factory(self.index) {
            Ok(detector) => {
                if init_tx
                    .send(Ok(format!("worker #{}: detector loaded", self.index)))
                    .is_err()
                {
                    return;
                }
                detector
            }
            Err(err) => {
                let _ = init_tx.send(Err((self.index, format!("failed to load detector: {err:#}"))));
                return;
            }
        };
        drop(init_tx);

        loop {
            if self.token.is_cancelled() {
                break;
            }
            let job = match self.jobs.recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if self.token.is_cancelled() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            self.process(detector.as_mut(), job);
        }
        debug!("detector worker #{} stopped", self.index);
    }

    fn process(&self, detector: &mut dyn Detector, job: DetectionJob) {
        let span = info_span!(
            "detection.job",
            worker = self.index,
            width = job.frame.width,
            height = job.frame.height
        );
        let _entered = span.enter();

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            detector.detect(&job.frame, job.confidence, job.nms)
        }))
        .unwrap_or_else(|_| Err(anyhow!("detector panicked")));
        histogram!("camwatch_detection_seconds").record(started.elapsed().as_secs_f64());

        match &result {
            Ok(boxes) => debug!(
                "worker #{} found {} box(es) after {:?}",
                self.index,
                boxes.len(),
                job.submitted_at.elapsed()
            ),
            Err(err) => {
                counter!("camwatch_detection_failures_total").increment(1);
                warn!("worker #{} detection failed: {err:#}", self.index);
            }
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        (job.on_complete)(result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::bail;

    use super::*;
    use crate::detector::FnDetector;

    fn boxes_from_width() -> DetectorFactory {
        Arc::new(|_| {
            Ok(Box::new(FnDetector::new(|frame, _, _| {
                Ok(vec![BoundingBox::new(0.0, 0.0, frame.width as f32, 1.0)])
            })) as Box<dyn Detector>)
        })
    }

    #[test]
    fn submit_returns_before_detection_finishes() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let release_rx = Arc::new(Mutex::new(release_rx));
        let factory: DetectorFactory = Arc::new(move |_| {
            let gate = release_rx.clone();
            Ok(Box::new(FnDetector::new(move |_, _, _| {
                let _ = gate.lock().unwrap().recv();
                Ok(Vec::new())
            })) as Box<dyn Detector>)
        });
        let mut dispatcher = DetectionDispatcher::start(1, factory).unwrap();

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let started = Instant::now();
        dispatcher
            .submit(Frame::filled(4, 4, [0, 0, 0]), 0.5, 0.4, move |r| {
                let _ = done_tx.send(r.is_ok());
            })
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(done_rx.try_recv().is_err());

        release_tx.send(()).unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn each_worker_builds_its_own_detector_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counted = builds.clone();
        let inner = boxes_from_width();
        let factory: DetectorFactory = Arc::new(move |index| {
            counted.fetch_add(1, Ordering::SeqCst);
            inner(index)
        });
        let mut dispatcher = DetectionDispatcher::start(3, factory).unwrap();
        assert_eq!(dispatcher.worker_count(), 3);

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        for width in 1..=6 {
            let tx = done_tx.clone();
            dispatcher
                .submit(Frame::filled(width, 1, [0, 0, 0]), 0.5, 0.4, move |r| {
                    let _ = tx.send(r.unwrap()[0].width as i32);
                })
                .unwrap();
        }
        let mut widths: Vec<i32> = (0..6)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        widths.sort();
        assert_eq!(widths, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(builds.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.shutdown(Duration::from_secs(1)), 0);
    }

    #[test]
    fn init_failure_is_reported_with_worker_index() {
        let factory: DetectorFactory = Arc::new(|index| {
            if index == 1 {
                bail!("model file missing");
            }
            Ok(Box::new(FnDetector::new(|_, _, _| Ok(Vec::new())))
                as Box<dyn Detector>)
        });
        match DetectionDispatcher::start(2, factory) {
            Err(DispatchError::WorkerInit { worker, message }) => {
                assert_eq!(worker, 1);
                assert!(message.contains("model file missing"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("pool should not start"),
        }
    }

    #[test]
    fn detector_errors_and_panics_reach_the_callback() {
        let factory: DetectorFactory = Arc::new(|_| {
            Ok(Box::new(FnDetector::new(|frame, _, _| {
                if frame.width == 1 {
                    panic!("boom");
                }
                bail!("inference failed")
            })) as Box<dyn Detector>)
        });
        let mut dispatcher = DetectionDispatcher::start(1, factory).unwrap();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        for width in [1, 2] {
            let tx = done_tx.clone();
            dispatcher
                .submit(Frame::filled(width, 1, [0, 0, 0]), 0.5, 0.4, move |r| {
                    let _ = tx.send(r.unwrap_err().to_string());
                })
                .unwrap();
        }
        let first = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, "detector panicked");
        assert_eq!(second, "inference failed");
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let mut dispatcher = DetectionDispatcher::start(1, boxes_from_width()).unwrap();
        assert_eq!(dispatcher.shutdown(Duration::from_secs(1)), 0);
        assert!(dispatcher.is_shut_down());
        let result = dispatcher.submit(Frame::filled(1, 1, [0, 0, 0]), 0.5, 0.4, |_| {});
        assert!(matches!(result, Err(DispatchError::Closed)));
    }

    #[test]
    fn zero_workers_is_an_error() {
        assert!(matches!(
            DetectionDispatcher::start(0, boxes_from_width()),
            Err(DispatchError::NoWorkers)
        ));
    }
}
