use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use vision::pipeline::{PipelineArgs, PipelineConfig};

use crate::discovery::{CameraLogin, NetworkScanner};

#[derive(Debug, Parser)]
#[command(
    name = "camwatch",
    version,
    about = "Track people across RTSP cameras and flag anyone who stops moving."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the tracking pipeline.
    Run(RunArgs),
    /// Scan a /24 network for RTSP cameras and print their stream URLs.
    Scan(ScanArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Camera stream URIs to track.
    #[arg(value_name = "URI")]
    pub cameras: Vec<String>,
    /// Also discover cameras on this network base (e.g. 10.145.80).
    #[arg(long, value_name = "BASE")]
    pub scan: Option<String>,
    #[command(flatten)]
    pub range: ScanRange,
    #[command(flatten)]
    pub login: LoginArgs,
    #[command(flatten)]
    pub pipeline: PipelineArgs,
    /// Directory annotated snapshots are written to.
    #[arg(long = "snapshot-dir", value_name = "DIR", default_value = "captures")]
    pub snapshot_dir: PathBuf,
    /// Seconds between snapshots of each camera.
    #[arg(long = "snapshot-secs", value_name = "SECS", default_value_t = 60)]
    pub snapshot_secs: u64,
    /// Run the detector on the CPU even when CUDA is available.
    #[arg(long)]
    pub cpu: bool,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Network base to scan (first three octets).
    #[arg(value_name = "BASE")]
    pub base: String,
    #[command(flatten)]
    pub range: ScanRange,
    #[command(flatten)]
    pub login: LoginArgs,
}

#[derive(Debug, Args)]
pub struct ScanRange {
    /// First host number to scan.
    #[arg(long = "scan-from", value_name = "N", default_value_t = 1)]
    pub from: u8,
    /// Last host number to scan.
    #[arg(long = "scan-to", value_name = "N", default_value_t = 254)]
    pub to: u8,
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    /// RTSP port checked and used in stream URLs.
    #[arg(long, value_name = "PORT", default_value_t = 554)]
    pub port: u16,
    #[arg(long, default_value = "admin")]
    pub username: String,
    #[arg(long, default_value = "")]
    pub password: String,
    /// Channel suffix: 101 main stream, 102 sub stream.
    #[arg(long = "stream-type", value_name = "ID", default_value = "102")]
    pub stream_type: String,
}

impl From<LoginArgs> for CameraLogin {
    fn from(args: LoginArgs) -> Self {
        Self {
            username: args.username,
            password: args.password,
            port: args.port,
            stream_type: args.stream_type,
        }
    }
}

/// Where the camera list comes from.
#[derive(Debug, Clone)]
pub struct CameraPlan {
    pub explicit: Vec<String>,
    pub scanner: Option<NetworkScanner>,
    pub login: CameraLogin,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cameras: CameraPlan,
    pub pipeline: PipelineConfig,
    pub snapshot_dir: PathBuf,
    pub snapshot_interval: Duration,
    pub use_cpu: bool,
}

impl TryFrom<RunArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunArgs) -> Result<Self> {
        if args.cameras.is_empty() && args.scan.is_none() {
            bail!("give at least one camera URI or --scan <BASE>");
        }
        if args.snapshot_secs == 0 {
            bail!("--snapshot-secs must be at least 1");
        }
        let scanner = args
            .scan
            .as_deref()
            .map(|base| NetworkScanner::new(base, args.range.from..=args.range.to, args.login.port))
            .transpose()?;
        Ok(Self {
            cameras: CameraPlan {
                explicit: args.cameras,
                scanner,
                login: args.login.into(),
            },
            pipeline: PipelineConfig::try_from(args.pipeline)?,
            snapshot_dir: args.snapshot_dir,
            snapshot_interval: Duration::from_secs(args.snapshot_secs),
            use_cpu: args.cpu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli> {
        Ok(Cli::try_parse_from(std::iter::once("camwatch").chain(args.iter().copied()))?)
    }

    fn run_config(args: &[&str]) -> Result<RunConfig> {
        match parse(args)?.command {
            Command::Run(run) => RunConfig::try_from(run),
            Command::Scan(_) => bail!("expected run"),
        }
    }

    #[test]
    fn run_accepts_uris_with_defaults() {
        let config = run_config(&["run", "rtsp://a/1", "rtsp://b/1"]).unwrap();
        assert_eq!(config.cameras.explicit.len(), 2);
        assert!(config.cameras.scanner.is_none());
        assert_eq!(config.snapshot_dir, PathBuf::from("captures"));
        assert_eq!(config.snapshot_interval, Duration::from_secs(60));
        assert_eq!(config.cameras.login.stream_type, "102");
        assert_eq!(config.pipeline.channel_capacity(2), 10);
    }

    #[test]
    fn run_needs_some_camera_source() {
        let err = run_config(&["run"]).unwrap_err();
        assert!(err.to_string().contains("--scan"));
        assert!(run_config(&["run", "--scan", "10.0.0"]).is_ok());
    }

    #[test]
    fn pipeline_validation_applies() {
        let err = run_config(&["run", "rtsp://a/1", "--stop-px", "30"]).unwrap_err();
        assert!(err.to_string().contains("--breakout-px"));
    }

    #[test]
    fn scan_parses_range_and_login() {
        let cli = parse(&[
            "scan", "192.168.1", "--scan-from", "10", "--scan-to", "20", "--username", "ops",
        ])
        .unwrap();
        let Command::Scan(scan) = cli.command else {
            panic!("expected scan");
        };
        assert_eq!(scan.base, "192.168.1");
        assert_eq!((scan.range.from, scan.range.to), (10, 20));
        assert_eq!(scan.login.username, "ops");
        assert_eq!(scan.login.port, 554);
    }
}
