mod cli;
mod detector;
mod discovery;
mod snapshot;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use video_ingest::{CancellationToken, FfmpegSource};
use vision::{
    PipelineOrchestrator,
    pipeline::{TelemetryOptions, telemetry},
};

use crate::{
    cli::{CameraPlan, Cli, Command, RunConfig, ScanArgs},
    discovery::{CameraLogin, NetworkScanner},
    snapshot::SnapshotSink,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Run(args) => run_pipeline(RunConfig::try_from(args)?),
        Command::Scan(args) => scan(args),
    }
}

fn run_pipeline(config: RunConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.pipeline.telemetry);
    telemetry::init_metrics_recorder(&config.pipeline.telemetry)?;

    let cameras = resolve_cameras(&config.cameras);
    if cameras.is_empty() {
        info!("no cameras found; exiting");
        return Ok(());
    }

    let token = CancellationToken::new();
    {
        let token = token.clone();
        if let Err(err) = ctrlc::set_handler(move || token.cancel()) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    }

    let factory = detector::detector_factory(&config.pipeline, config.use_cpu)?;
    let size = (config.pipeline.width, config.pipeline.height);
    let mut orchestrator =
        PipelineOrchestrator::new(config.pipeline.clone(), cameras.len(), factory, token)?;
    for uri in &cameras {
        orchestrator.register_stream(FfmpegSource::new(uri.as_str(), size))?;
    }

    let mut sink = SnapshotSink::new(&config.snapshot_dir, config.snapshot_interval)?;
    info!(
        "tracking {} camera(s); snapshots every {}s in {}. Press Ctrl+C to stop",
        cameras.len(),
        config.snapshot_interval.as_secs(),
        config.snapshot_dir.display()
    );
    let report = orchestrator
        .run(&mut sink)
        .context("pipeline stopped with an error")?;
    if report.abandoned_ingestors > 0 || report.abandoned_workers > 0 {
        warn!(?report, "some threads did not stop in time");
    }
    Ok(())
}

fn resolve_cameras(plan: &CameraPlan) -> Vec<String> {
    let mut cameras = plan.explicit.clone();
    if let Some(scanner) = &plan.scanner {
        for url in discover_urls(scanner, &plan.login) {
            if !cameras.contains(&url) {
                cameras.push(url);
            }
        }
    }
    cameras
}

fn discover_urls(scanner: &NetworkScanner, login: &CameraLogin) -> Vec<String> {
    info!("scanning {} on port {}", scanner.network(), scanner.port());
    let found = scanner.discover(|ip| info!("camera found at {ip}"));
    info!("scan complete: {} camera(s) found", found.len());
    found.into_iter().map(|ip| login.rtsp_url(ip)).collect()
}

fn scan(args: ScanArgs) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&TelemetryOptions::default());
    let scanner = NetworkScanner::new(&args.base, args.range.from..=args.range.to, args.login.port)?;
    let login = CameraLogin::from(args.login);
    for url in discover_urls(&scanner, &login) {
        println!("{url}");
    }
    Ok(())
}
