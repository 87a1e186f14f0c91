//! Configuration parsing for the tracking pipeline.
//!
//! This module owns translation of CLI arguments into a `PipelineConfig`
//! which the orchestrator, sessions, and ingestors use without re-parsing
//! flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};
use video_ingest::IngestorSettings;

use crate::{
    session::{CarryOver, SessionSettings},
    tracking::TrackerParams,
};

/// Frames buffered per camera when `--queue-capacity` is not given.
pub const FRAMES_PER_CAMERA: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CarryOverArg {
    /// Only the first new tracker inherits state from the first old one.
    First,
    /// Match new and old trackers greedily by IoU.
    Iou,
}

#[derive(Clone, Debug, PartialEq)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct PipelineConfig {
    /// Processing width every frame is resized to.
    pub width: i32,
    /// Processing height every frame is resized to.
    pub height: i32,
    /// Fixed channel capacity; `None` derives it from the camera count.
    pub queue_capacity: Option<usize>,
    pub push_timeout: Duration,
    pub pop_timeout: Duration,
    pub reconnect_delay: Duration,
    pub join_timeout: Duration,
    /// Number of detector workers.
    pub workers: usize,
    /// TorchScript model used by the detector workers.
    pub model_path: Option<PathBuf>,
    /// Square detector input edge in pixels.
    pub detector_size: i32,
    pub session: SessionSettings,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default, PartialEq)]
/// Optional telemetry knobs for tracing and metrics export.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            queue_capacity: None,
            push_timeout: Duration::from_secs(1),
            pop_timeout: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(5),
            join_timeout: Duration::from_secs(2),
            workers: 1,
            model_path: None,
            detector_size: 416,
            session: SessionSettings::default(),
            telemetry: TelemetryOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Channel capacity for `cameras` registered streams.
    pub fn channel_capacity(&self, cameras: usize) -> usize {
        self.queue_capacity
            .unwrap_or(FRAMES_PER_CAMERA * cameras.max(1))
            .max(1)
    }

    pub fn ingestor_settings(&self) -> IngestorSettings {
        IngestorSettings {
            width: self.width,
            height: self.height,
            reconnect_delay: self.reconnect_delay,
            push_timeout: self.push_timeout,
        }
    }
}

/// Pipeline flags shared by every subcommand that runs the tracker.
#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// Processing width in pixels.
    #[arg(long, value_name = "PX", default_value_t = 640)]
    pub width: i32,
    /// Processing height in pixels.
    #[arg(long, value_name = "PX", default_value_t = 480)]
    pub height: i32,
    /// Frame queue capacity (default: 5 per camera).
    #[arg(long = "queue-capacity", value_name = "N")]
    pub queue_capacity: Option<usize>,
    /// How long an ingestor waits for queue space before dropping a frame.
    #[arg(long = "push-timeout-ms", value_name = "MS", default_value_t = 1000)]
    pub push_timeout_ms: u64,
    /// How long the consumer waits for a frame before checking for shutdown.
    #[arg(long = "pop-timeout-ms", value_name = "MS", default_value_t = 100)]
    pub pop_timeout_ms: u64,
    /// Run detection every N frames per camera.
    #[arg(long = "detect-every", value_name = "N", default_value_t = 15)]
    pub detect_every: u64,
    /// Number of detector workers.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub workers: usize,
    /// Minimum detection confidence.
    #[arg(long, value_name = "SCORE", default_value_t = 0.5)]
    pub confidence: f32,
    /// IoU threshold for non-maximum suppression.
    #[arg(long, value_name = "IOU", default_value_t = 0.4)]
    pub nms: f32,
    /// TorchScript detector model path.
    #[arg(long, value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// Detector input edge in pixels.
    #[arg(long = "detector-size", value_name = "PX", default_value_t = 416)]
    pub detector_size: i32,
    /// Windowed displacement below which an object counts as still.
    #[arg(long = "stop-px", value_name = "PX", default_value_t = 10.0)]
    pub stop_px: f32,
    /// Windowed displacement above which a stopped object moves again.
    #[arg(long = "breakout-px", value_name = "PX", default_value_t = 25.0)]
    pub breakout_px: f32,
    /// Seconds an object must stay still before it is marked stopped.
    #[arg(long = "stop-secs", value_name = "SECS", default_value_t = 5.0)]
    pub stop_secs: f32,
    /// Box smoothing factor in (0, 1); higher is steadier but lags more.
    #[arg(long, value_name = "F", default_value_t = 0.6)]
    pub smoothing: f32,
    /// Gaussian blur sigma applied before tracking (0 disables).
    #[arg(long = "blur-sigma", value_name = "SIGMA", default_value_t = 1.0)]
    pub blur_sigma: f32,
    /// Seconds between reconnect attempts for a lost camera.
    #[arg(long = "reconnect-secs", value_name = "SECS", default_value_t = 5.0)]
    pub reconnect_secs: f32,
    /// Seconds to wait for each thread at shutdown before abandoning it.
    #[arg(long = "join-timeout-secs", value_name = "SECS", default_value_t = 2.0)]
    pub join_timeout_secs: f32,
    /// How tracker state survives a detection cycle.
    #[arg(long = "carry-over", value_enum, default_value_t = CarryOverArg::First)]
    pub carry_over: CarryOverArg,
    /// Minimum IoU for `--carry-over iou` matches.
    #[arg(long = "iou-threshold", value_name = "IOU", default_value_t = 0.3)]
    pub iou_threshold: f32,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl TryFrom<PipelineArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: PipelineArgs) -> Result<Self> {
        if args.width <= 0 || args.height <= 0 {
            bail!("--width and --height must be positive integers");
        }
        if args.queue_capacity == Some(0) {
            bail!("--queue-capacity must be at least 1");
        }
        if args.detect_every == 0 {
            bail!("--detect-every must be at least 1");
        }
        if args.workers == 0 {
            bail!("--workers must be at least 1");
        }
        if !(args.confidence > 0.0 && args.confidence <= 1.0) {
            bail!("--confidence must be in (0, 1]");
        }
        if !(args.nms > 0.0 && args.nms <= 1.0) {
            bail!("--nms must be in (0, 1]");
        }
        if !(args.iou_threshold > 0.0 && args.iou_threshold <= 1.0) {
            bail!("--iou-threshold must be in (0, 1]");
        }
        if args.detector_size <= 0 {
            bail!("--detector-size must be a positive integer");
        }
        if !(args.smoothing > 0.0 && args.smoothing < 1.0) {
            bail!("--smoothing must be strictly between 0 and 1");
        }
        if !(args.stop_px.is_finite() && args.stop_px > 0.0) {
            bail!("--stop-px must be a positive number");
        }
        if !args.breakout_px.is_finite() || args.breakout_px <= args.stop_px {
            bail!(
                "--breakout-px ({}) must be greater than --stop-px ({})",
                args.breakout_px,
                args.stop_px
            );
        }
        if !(args.blur_sigma.is_finite() && args.blur_sigma >= 0.0) {
            bail!("--blur-sigma must be a non-negative number");
        }
        let stop_duration = seconds("--stop-secs", args.stop_secs)?;
        let reconnect_delay = seconds("--reconnect-secs", args.reconnect_secs)?;
        let join_timeout = seconds("--join-timeout-secs", args.join_timeout_secs)?;

        let carry_over = match args.carry_over {
            CarryOverArg::First => CarryOver::First,
            CarryOverArg::Iou => CarryOver::Iou {
                threshold: args.iou_threshold,
            },
        };

        Ok(Self {
            width: args.width,
            height: args.height,
            queue_capacity: args.queue_capacity,
            push_timeout: Duration::from_millis(args.push_timeout_ms),
            pop_timeout: Duration::from_millis(args.pop_timeout_ms.max(1)),
            reconnect_delay,
            join_timeout,
            workers: args.workers,
            model_path: args.model,
            detector_size: args.detector_size,
            session: SessionSettings {
                detect_every: args.detect_every,
                confidence: args.confidence,
                nms: args.nms,
                blur_sigma: args.blur_sigma,
                carry_over,
                tracker: TrackerParams {
                    stop_px: args.stop_px,
                    breakout_px: args.breakout_px,
                    stop_duration,
                    smoothing: args.smoothing,
                    ..TrackerParams::default()
                },
            },
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                metrics_addr: args.metrics_addr,
            },
        })
    }
}

fn seconds(flag: &str, value: f32) -> Result<Duration> {
    match Duration::try_from_secs_f32(value) {
        Ok(duration) => Ok(duration),
        Err(_) => bail!("{flag} must be a non-negative number of seconds, got {value}"),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        pipeline: PipelineArgs,
    }

    fn parse(args: &[&str]) -> Result<PipelineConfig> {
        let harness = Harness::try_parse_from(std::iter::once("camwatch").chain(args.iter().copied()))?;
        PipelineConfig::try_from(harness.pipeline)
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&[]).unwrap();
        let defaults = PipelineConfig::default();
        assert_eq!(config, defaults);
        assert_eq!(config.channel_capacity(3), 15);
        assert_eq!(config.session.tracker.stop_px, 10.0);
        assert_eq!(config.session.tracker.breakout_px, 25.0);
        assert_eq!(config.session.detect_every, 15);
    }

    #[test]
    fn breakout_must_exceed_stop() {
        let err = parse(&["--stop-px", "20", "--breakout-px", "20"]).unwrap_err();
        assert!(err.to_string().contains("--breakout-px"));
        assert!(parse(&["--stop-px", "20", "--breakout-px", "21"]).is_ok());
    }

    #[test]
    fn non_finite_or_huge_values_are_errors_not_panics() {
        assert!(parse(&["--stop-px", "NaN"]).is_err());
        assert!(parse(&["--breakout-px", "NaN"]).is_err());
        assert!(parse(&["--breakout-px", "inf"]).is_err());
        let err = parse(&["--stop-secs", "1e30"]).unwrap_err();
        assert!(err.to_string().contains("--stop-secs"));
        assert!(parse(&["--reconnect-secs", "1e30"]).is_err());
        assert!(parse(&["--join-timeout-secs", "-1"]).is_err());
        assert!(parse(&["--stop-secs", "0"]).is_ok());
    }

    #[test]
    fn smoothing_is_open_interval() {
        assert!(parse(&["--smoothing", "0"]).is_err());
        assert!(parse(&["--smoothing", "1"]).is_err());
        assert!(parse(&["--smoothing", "0.9"]).is_ok());
    }

    #[test]
    fn rejects_zero_counts() {
        assert!(parse(&["--workers", "0"]).is_err());
        assert!(parse(&["--detect-every", "0"]).is_err());
        assert!(parse(&["--queue-capacity", "0"]).is_err());
    }

    #[test]
    fn iou_carry_over_uses_threshold() {
        let config = parse(&["--carry-over", "iou", "--iou-threshold", "0.5"]).unwrap();
        assert_eq!(config.session.carry_over, CarryOver::Iou { threshold: 0.5 });
    }

    #[test]
    fn explicit_capacity_wins() {
        let config = parse(&["--queue-capacity", "4"]).unwrap();
        assert_eq!(config.channel_capacity(10), 4);
    }
}
