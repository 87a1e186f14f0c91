//! Per-camera ingestion thread.
//!
//! An ingestor owns one [`FrameSource`] and loops until cancelled: connect
//! (retrying every `reconnect_delay` on failure), read, resize to the
//! processing resolution, and push `(source_id, frame)` onto the shared
//! channel. A read failure is handled exactly like a failed connect. A full
//! channel drops the frame; nothing here is ever fatal to the process.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    cancel::CancellationToken,
    channel::{FrameProducer, PushError},
    source::FrameSource,
    thread::spawn_thread,
    types::Frame,
};

/// Item carried by the shared frame channel.
pub type SourcedFrame = (String, Frame);

#[derive(Clone, Debug)]
pub struct IngestorSettings {
    /// Processing width every frame is resized to.
    pub width: i32,
    /// Processing height every frame is resized to.
    pub height: i32,
    /// Fixed delay between connection attempts.
    pub reconnect_delay: Duration,
    /// Longest a push may wait for room in the channel.
    pub push_timeout: Duration,
}

impl Default for IngestorSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            reconnect_delay: Duration::from_secs(5),
            push_timeout: Duration::from_secs(1),
        }
    }
}

/// Counters shared between an ingestor thread and its observers.
#[derive(Debug, Default)]
pub struct IngestStats {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    read_failures: AtomicU64,
    frames_pushed: AtomicU64,
    frames_dropped: AtomicU64,
}

impl IngestStats {
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    pub fn frames_pushed(&self) -> u64 {
        self.frames_pushed.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

pub struct StreamIngestor<S: FrameSource> {
    source_id: String,
    source: S,
    output: FrameProducer<SourcedFrame>,
    settings: IngestorSettings,
    stats: Arc<IngestStats>,
}

impl<S: FrameSource> StreamIngestor<S> {
    pub fn new(source: S, output: FrameProducer<SourcedFrame>, settings: IngestorSettings) -> Self {
        Self {
            source_id: source.uri().to_string(),
            source,
            output,
            settings,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Run the connect/read/push loop on the current thread until `token` is cancelled.
    pub fn run(&mut self, token: &CancellationToken) {
        let source_id = self.source_id.clone();
        while !token.is_cancelled() {
            if !self.source.is_open() {
                self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
                match self.source.open() {
                    Ok(()) => {
                        info!(source = %source_id, "stream connected");
                    }
                    Err(err) => {
                        self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("camwatch_reconnects_total", "source" => source_id.clone())
                            .increment(1);
                        warn!(
                            source = %source_id,
                            "stream unavailable ({err}); retrying in {:.1}s",
                            self.settings.reconnect_delay.as_secs_f32()
                        );
                        if token.wait_timeout(self.settings.reconnect_delay) {
                            break;
                        }
                        continue;
                    }
                }
            }

            let frame = match self.source.read() {
                Ok(frame) => frame,
                Err(err) => {
                    self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("camwatch_reconnects_total", "source" => source_id.clone())
                        .increment(1);
                    warn!(
                        source = %source_id,
                        "frame read failed ({err}); reconnecting in {:.1}s",
                        self.settings.reconnect_delay.as_secs_f32()
                    );
                    self.source.release();
                    if token.wait_timeout(self.settings.reconnect_delay) {
                        break;
                    }
                    continue;
                }
            };

            let frame = match frame.resized(self.settings.width, self.settings.height) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(source = %source_id, "discarding unusable frame: {err}");
                    continue;
                }
            };

            match self
                .output
                .push((source_id.clone(), frame), self.settings.push_timeout)
            {
                Ok(()) => {
                    self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("camwatch_frames_ingested_total", "source" => source_id.clone())
                        .increment(1);
                }
                Err(PushError::Full(_)) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("camwatch_frames_dropped_total", "source" => source_id.clone())
                        .increment(1);
                    warn!(source = %source_id, "frame queue full; dropping frame to stay real-time");
                }
                Err(PushError::Closed(_)) => {
                    debug!(source = %source_id, "frame queue closed; stopping ingestor");
                    break;
                }
            }
        }

        if self.source.is_open() {
            self.source.release();
        }
        info!(source = %source_id, "ingestor stopped");
    }
}

impl<S: FrameSource + 'static> StreamIngestor<S> {
    /// Move the ingestor onto its own named thread.
    pub fn spawn(mut self, token: CancellationToken) -> io::Result<IngestorHandle> {
        let source_id = self.source_id.clone();
        let stats = self.stats.clone();
        let thread = spawn_thread(format!("ingest-{}", short_name(&source_id)), move || {
            self.run(&token)
        })?;
        Ok(IngestorHandle {
            source_id,
            stats,
            thread,
        })
    }
}

/// Handle to a running ingestor thread.
pub struct IngestorHandle {
    pub source_id: String,
    pub stats: Arc<IngestStats>,
    pub thread: thread::JoinHandle<()>,
}

// Thread names are truncated by the OS; keep the host part of the URI.
fn short_name(uri: &str) -> String {
    let without_scheme = uri.split("://").last().unwrap_or(uri);
    let host = without_scheme
        .rsplit('@')
        .next()
        .unwrap_or(without_scheme)
        .split(['/', ':'])
        .find(|part| !part.is_empty())
        .unwrap_or(without_scheme);
    host.chars().take(12).collect()
}
