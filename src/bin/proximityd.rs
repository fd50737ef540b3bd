//! proximityd - calibrated proximity alert daemon
//!
//! This daemon:
//! 1. Calibrates each reference group from its reference image (fatal on failure)
//! 2. Opens the alert store and starts the background sink writer
//! 3. Runs the camera -> detector -> alert pipeline on a worker thread
//! 4. Serves snapshots and persisted alerts on a loopback HTTP API
//! 5. Stops on Ctrl-C, `POST /close`, or when the pipeline ends on its own

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use proximity_kernel::api::{ApiConfig, ApiServer};
use proximity_kernel::ui::{Ui, UiMode};
use proximity_kernel::{
    calibrate_all, open_alarm, open_backend, open_source, AlertEffects, FrameProcessor,
    LoopSettings, PipelineExit, PipelineLoop, PipelineParts, ProximityAlertController,
    ProximityConfig, SinkWriter, SnapshotCell, SqliteEventStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "PROXIMITY_CONFIG")]
    config: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, value_enum, default_value_t = UiMode::Auto, value_name = "MODE")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::new(args.ui);
    let cfg = ProximityConfig::load_from(args.config.as_deref())?;

    let mut detector = {
        let stage = ui.stage("Open detector");
        let detector = open_backend(&cfg.detector)?;
        stage.done();
        detector
    };

    let calibration = {
        let stage = ui.stage("Calibrate reference images");
        let calibration = calibrate_all(detector.as_mut(), &cfg.references)?;
        stage.done();
        calibration
    };
    for constant in calibration.constants() {
        log::info!(
            "focal length {} = {:.2} ({} px at {} in, width {} in)",
            constant.reference_group(),
            constant.focal_length(),
            constant.reference_pixel_width(),
            constant.known_distance(),
            constant.known_width()
        );
    }

    let writer = {
        let stage = ui.stage("Open alert store");
        let store = SqliteEventStore::open(&cfg.db_path)?;
        let writer = SinkWriter::spawn(Box::new(store), cfg.sink)?;
        stage.done();
        writer
    };

    let alarm = open_alarm(cfg.alarm_command.as_deref())?;
    let source = open_source(&cfg.camera)?;
    let snapshots = Arc::new(SnapshotCell::new());
    let controller = ProximityAlertController::new(cfg.threshold_distance)
        .with_stale_after(cfg.pipeline.stale_after);
    let parts = PipelineParts {
        source,
        detector,
        processor: FrameProcessor::new(calibration, cfg.classes.clone()),
        controller,
        effects: AlertEffects::new(alarm, writer.handle()),
    };
    let settings = LoopSettings {
        target_fps: Some(cfg.camera.target_fps),
        max_consecutive_detector_failures: cfg.pipeline.max_consecutive_detector_failures,
        render: true,
    };
    let pipeline = PipelineLoop::new(parts, snapshots.clone(), settings).spawn()?;

    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(
        api_config,
        snapshots,
        Box::new(SqliteEventStore::open(&cfg.db_path)?),
    )
    .with_closer(pipeline.closer())
    .spawn()?;
    log::info!("proximity api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!(
        "proximityd running. threshold {:.2} in, writing alerts to {}",
        cfg.threshold_distance,
        cfg.db_path
    );
    while !pipeline.is_finished() {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => {
                log::info!("shutdown signal received, closing pipeline...");
                pipeline.close();
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let report = pipeline.join()?;
    api_handle.stop()?;
    let sink_stats = writer.finish()?;
    log::info!(
        "frames={} detector_failures={} alerts_started={} events_written={} events_dropped={}",
        report.frames_processed,
        report.detector_failures,
        report.effects.starts,
        sink_stats.written,
        sink_stats.dropped
    );

    match report.exit {
        PipelineExit::Closed | PipelineExit::EndOfStream => Ok(()),
        PipelineExit::CameraUnavailable(reason) => Err(anyhow!("pipeline stopped: {}", reason)),
        PipelineExit::DetectorFailures(n) => Err(anyhow!(
            "pipeline stopped after {} consecutive detector failures",
            n
        )),
    }
}
