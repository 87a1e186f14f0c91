//! Pipeline orchestrator tying together ingestion, detection, and tracking.
//!
//! The orchestrator owns the shared frame channel, the detection pool, and
//! every camera session. Its loop runs on one thread: frames are popped and
//! routed to their session, and detection results come back through a
//! channel and are applied here too, so sessions are never shared.

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender, unbounded};
use metrics::gauge;
use ml_core::{DetectionDispatcher, DetectorFactory};
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{
    CancellationToken, FrameChannel, FrameSource, IngestorHandle, Pop, SourcedFrame,
    StreamIngestor, join_with_timeout,
};

use crate::{
    pipeline::{config::PipelineConfig, sink::FrameSink},
    session::{
        CameraTrackingSession, DetectionOutcome, DetectionRequest, DetectionRequester,
        Reconciliation,
    },
    tracking::{TrackingBackend, TrackingFactory},
};

/// What a bounded shutdown left behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Frames still queued when the channel was closed.
    pub discarded_frames: usize,
    pub abandoned_workers: usize,
    pub abandoned_ingestors: usize,
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    token: CancellationToken,
    channel: FrameChannel<SourcedFrame>,
    dispatcher: DetectionDispatcher,
    sessions: HashMap<String, CameraTrackingSession>,
    tracking: TrackingFactory,
    ingestors: Vec<IngestorHandle>,
    outcome_tx: Sender<DetectionOutcome>,
    outcome_rx: Receiver<DetectionOutcome>,
    report: Option<ShutdownReport>,
}

impl PipelineOrchestrator {
    /// Start the detection pool and size the frame channel for `cameras` streams.
    ///
    /// Fails only if a detector worker cannot initialise.
    pub fn new(
        config: PipelineConfig,
        cameras: usize,
        factory: DetectorFactory,
        token: CancellationToken,
    ) -> Result<Self> {
        let dispatcher = DetectionDispatcher::start(config.workers, factory)
            .context("failed to start detection pool")?;
        let channel = FrameChannel::new(config.channel_capacity(cameras));
        let (outcome_tx, outcome_rx) = unbounded();
        debug!(
            "frame channel capacity {} for {cameras} camera(s)",
            channel.capacity()
        );
        Ok(Self {
            config,
            token,
            channel,
            dispatcher,
            sessions: HashMap::new(),
            tracking: Arc::new(TrackingBackend::from_build),
            ingestors: Vec::new(),
            outcome_tx,
            outcome_rx,
            report: None,
        })
    }

    /// Replace the flow/corner backend used by streams registered after this call.
    pub fn with_tracking(mut self, tracking: TrackingFactory) -> Self {
        self.tracking = tracking;
        self
    }

    /// Create a session for `source` and start its ingestor thread.
    pub fn register_stream<S: FrameSource + 'static>(&mut self, source: S) -> Result<()> {
        let backend = (self.tracking)()
            .with_context(|| format!("no tracking backend for {}", source.uri()))?;
        let session = CameraTrackingSession::new(source.uri(), self.config.session.clone(), backend);
        self.register_stream_with_session(source, session)
    }

    /// Like [`register_stream`](Self::register_stream) with a caller-built session.
    pub fn register_stream_with_session<S: FrameSource + 'static>(
        &mut self,
        source: S,
        session: CameraTrackingSession,
    ) -> Result<()> {
        let source_id = source.uri().to_string();
        if session.source_id() != source_id {
            bail!(
                "session for {} cannot track stream {source_id}",
                session.source_id()
            );
        }
        if self.sessions.contains_key(&source_id) {
            bail!("stream {source_id} is already registered");
        }
        if self.report.is_some() {
            bail!("pipeline has already shut down");
        }

        let ingestor =
            StreamIngestor::new(source, self.channel.producer(), self.config.ingestor_settings());
        let handle = ingestor
            .spawn(self.token.clone())
            .with_context(|| format!("failed to spawn ingestor for {source_id}"))?;
        info!(source = %source_id, "registered stream");
        self.sessions.insert(source_id, session);
        self.ingestors.push(handle);
        Ok(())
    }

    pub fn session(&self, source_id: &str) -> Option<&CameraTrackingSession> {
        self.sessions.get(source_id)
    }

    pub fn ingestors(&self) -> &[IngestorHandle] {
        &self.ingestors
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run the consumer loop until the token is cancelled or `sink` asks to
    /// stop, then shut everything down.
    pub fn run(&mut self, sink: &mut dyn FrameSink) -> Result<ShutdownReport> {
        info!("pipeline running with {} stream(s)", self.sessions.len());
        while !self.token.is_cancelled() {
            if sink.shutdown_requested() {
                info!("renderer requested shutdown");
                break;
            }
            self.apply_outcomes();
            gauge!("camwatch_queue_depth").set(self.channel.len() as f64);

            let (source_id, frame) = match self.channel.pop(self.config.pop_timeout) {
                Pop::Item(item) => item,
                Pop::Empty => continue,
                Pop::Closed => break,
            };
            self.apply_outcomes();

            let Some(session) = self.sessions.get_mut(&source_id) else {
                warn!(source = %source_id, "frame from unregistered stream dropped");
                continue;
            };
            let span = info_span!("pipeline.frame", source = %source_id);
            let _guard = span.enter();
            let requester = DispatchRequester {
                dispatcher: &self.dispatcher,
                outcomes: &self.outcome_tx,
            };
            match session.process_frame(frame, &requester) {
                Ok(annotated) => {
                    if let Err(err) = sink.show(annotated) {
                        warn!(source = %source_id, "renderer rejected frame: {err:#}");
                    }
                }
                Err(err) => error!(source = %source_id, "failed to process frame: {err:#}"),
            }
        }

        let report = self.shutdown();
        if let Err(err) = sink.close() {
            warn!("failed to close renderer: {err:#}");
        }
        Ok(report)
    }

    /// Stop ingestors and workers, close the channel, and join every thread
    /// for at most the configured timeout. Safe to call more than once.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if let Some(report) = self.report {
            return report;
        }
        info!("shutting down pipeline");
        self.token.cancel();
        let abandoned_workers = self.dispatcher.shutdown(self.config.join_timeout);
        let discarded_frames = self.channel.close();

        let mut abandoned_ingestors = 0;
        for handle in self.ingestors.drain(..) {
            match join_with_timeout(handle.thread, self.config.join_timeout) {
                Some(Ok(())) => {}
                Some(Err(_)) => warn!(source = %handle.source_id, "ingestor panicked"),
                None => abandoned_ingestors += 1,
            }
        }

        let report = ShutdownReport {
            discarded_frames,
            abandoned_workers,
            abandoned_ingestors,
        };
        info!(?report, "pipeline stopped");
        self.report = Some(report);
        report
    }

    fn apply_outcomes(&mut self) {
        for outcome in self.outcome_rx.try_iter() {
            let Some(session) = self.sessions.get_mut(&outcome.source_id) else {
                continue;
            };
            let source_id = outcome.source_id.clone();
            if let Reconciliation::Applied { trackers } = session.apply_detection(outcome) {
                debug!(source = %source_id, "now tracking {trackers} object(s)");
            }
        }
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Routes session requests into the shared pool and results back to the loop.
struct DispatchRequester<'a> {
    dispatcher: &'a DetectionDispatcher,
    outcomes: &'a Sender<DetectionOutcome>,
}

impl DetectionRequester for DispatchRequester<'_> {
    fn request(&self, request: DetectionRequest) -> bool {
        let DetectionRequest {
            source_id,
            generation,
            frame,
            confidence,
            nms,
        } = request;
        let outcomes = self.outcomes.clone();
        let submitted = self
            .dispatcher
            .submit(frame, confidence, nms, move |result| {
                let outcome = DetectionOutcome {
                    source_id,
                    generation,
                    result,
                };
                if outcomes.send(outcome).is_err() {
                    debug!("pipeline stopped before detection result arrived");
                }
            });
        match submitted {
            Ok(()) => true,
            Err(err) => {
                debug!("detection request rejected: {err}");
                false
            }
        }
    }
}
