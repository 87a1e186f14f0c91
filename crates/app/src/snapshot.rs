//! Snapshot renderer: periodic JPEG + JSON captures per camera.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use tracing::{debug, info};
use vision::{AnnotatedFrame, FrameSink, TrackState, TrackSummary};

const JPEG_QUALITY: u8 = 85;
const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SnapshotRecord<'a> {
    camera: &'a str,
    frame_number: u64,
    timestamp_ms: i64,
    captured_at: String,
    tracks: &'a [TrackSummary],
}

pub struct SnapshotSink {
    dir: PathBuf,
    interval: Duration,
    latest: HashMap<String, AnnotatedFrame>,
    last_saved: HashMap<String, Instant>,
    last_summary: Instant,
}

impl SnapshotSink {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot directory {}", dir.display()))?;
        Ok(Self {
            dir,
            interval,
            latest: HashMap::new(),
            last_saved: HashMap::new(),
            last_summary: Instant::now(),
        })
    }

    /// Write `<camera>.jpg` and `<camera>.json`, replacing earlier captures.
    pub fn save(&self, frame: &AnnotatedFrame) -> Result<PathBuf> {
        let camera = camera_slug(&frame.source_id);
        let jpeg_path = self.dir.join(format!("{camera}.jpg"));
        let json_path = self.dir.join(format!("{camera}.json"));

        let mut writer = BufWriter::new(
            File::create(&jpeg_path)
                .with_context(|| format!("failed to create {}", jpeg_path.display()))?,
        );
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
            .encode_image(&frame.image)
            .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
        writer.flush()?;

        let record = SnapshotRecord {
            camera: &camera,
            frame_number: frame.frame_number,
            timestamp_ms: frame.timestamp_ms,
            captured_at: Utc::now().to_rfc3339(),
            tracks: &frame.tracks,
        };
        let json = File::create(&json_path)
            .with_context(|| format!("failed to create {}", json_path.display()))?;
        let mut writer = BufWriter::new(json);
        serde_json::to_writer_pretty(&mut writer, &record)?;
        writer.flush()?;

        debug!(camera = %camera, path = %jpeg_path.display(), "snapshot saved");
        Ok(jpeg_path)
    }

    fn log_summary(&self) {
        let mut cameras: Vec<_> = self.latest.values().collect();
        cameras.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        for frame in cameras {
            let stopped = frame
                .tracks
                .iter()
                .filter(|t| t.state == TrackState::Stopped)
                .count();
            info!(
                camera = %camera_slug(&frame.source_id),
                frame = frame.frame_number,
                tracked = frame.tracks.len(),
                stopped,
                "camera summary"
            );
        }
    }
}

impl FrameSink for SnapshotSink {
    fn show(&mut self, frame: AnnotatedFrame) -> Result<()> {
        let now = Instant::now();
        let due = self
            .last_saved
            .get(&frame.source_id)
            .is_none_or(|last| now.duration_since(*last) >= self.interval);
        let saved = if due {
            self.last_saved.insert(frame.source_id.clone(), now);
            Some(self.save(&frame))
        } else {
            None
        };

        self.latest.insert(frame.source_id.clone(), frame);
        if now.duration_since(self.last_summary) >= SUMMARY_INTERVAL {
            self.last_summary = now;
            self.log_summary();
        }
        saved.transpose().map(|_| ())
    }

    fn close(&mut self) -> Result<()> {
        for frame in self.latest.values() {
            self.save(frame)?;
        }
        info!(
            "saved final snapshots for {} camera(s) to {}",
            self.latest.len(),
            self.dir.display()
        );
        Ok(())
    }
}

/// File-safe camera name: the host and port of the URI, without credentials.
pub fn camera_slug(uri: &str) -> String {
    let without_scheme = uri.split("://").last().unwrap_or(uri);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let slug: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if slug.is_empty() { "camera".to_string() } else { slug }
}
