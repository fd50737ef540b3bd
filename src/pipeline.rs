//! Worker loop: camera -> detector -> processor -> alert controller.
//!
//! Each iteration:
//! 1. Checks the close flag. A close issued while a frame is in flight lets
//!    that frame finish and stops before the next acquisition.
//! 2. Acquires a frame. End of stream or a read error ends the loop; the
//!    camera is never retried.
//! 3. Runs the detector. A failure skips the frame without touching alert
//!    state; too many in a row end the loop.
//! 4. Annotates, steps the controller, applies effects, then publishes a
//!    snapshot of frame, detections and alert state in one swap.
//!
//! The source and detector are owned by the worker and dropped when it exits.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::alert::{AlertEffects, EffectStats, ProximityAlertController};
use crate::detect::DetectorBackend;
use crate::error::ProximityError;
use crate::ingest::FrameSource;
use crate::processor::{AnnotatedDetection, FrameProcessor, ProcessorStats};
use crate::render::{encode_jpeg, render_overlay};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Everything a consumer may see of one processed frame.
#[derive(Debug, Serialize)]
pub struct PipelineSnapshot {
    pub frame_index: u64,
    pub frame_label: Option<String>,
    pub published_at: DateTime<Local>,
    pub alert_active: bool,
    /// Seconds since the alert flag last changed.
    pub alert_state_age_secs: f64,
    pub detections: Vec<SnapshotDetection>,
    /// Last known distance per class, including classes absent from this frame.
    pub objects: BTreeMap<String, f64>,
    #[serde(skip)]
    pub jpeg: Option<Vec<u8>>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotDetection {
    #[serde(flatten)]
    pub annotated: AnnotatedDetection,
    pub label_text: String,
    pub distance_text: Option<String>,
}

impl From<AnnotatedDetection> for SnapshotDetection {
    fn from(annotated: AnnotatedDetection) -> Self {
        Self {
            label_text: annotated.label_text(),
            distance_text: annotated.distance_text(),
            annotated,
        }
    }
}

/// Latest-snapshot slot shared between the worker and readers.
///
/// Writers swap in a whole new `Arc`; readers clone the `Arc` and never hold
/// the lock while serializing.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    latest: Mutex<Option<Arc<PipelineSnapshot>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: PipelineSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.latest.lock() {
            Ok(mut slot) => *slot = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
    }

    pub fn latest(&self) -> Option<Arc<PipelineSnapshot>> {
        match self.latest.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum PipelineExit {
    Closed,
    EndOfStream,
    CameraUnavailable(String),
    DetectorFailures(u32),
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub frames_processed: u64,
    pub detector_failures: u64,
    pub exit: PipelineExit,
    #[serde(skip)]
    pub effects: EffectStats,
    #[serde(skip)]
    pub processor: ProcessorStats,
}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    /// Sleep out the rest of each frame budget. `None` runs flat out.
    pub target_fps: Option<u32>,
    pub max_consecutive_detector_failures: u32,
    /// Render and JPEG-encode an overlay for each snapshot.
    pub render: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            target_fps: None,
            max_consecutive_detector_failures: 5,
            render: true,
        }
    }
}

pub struct PipelineParts {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn DetectorBackend>,
    pub processor: FrameProcessor,
    pub controller: ProximityAlertController,
    pub effects: AlertEffects,
}

pub struct PipelineLoop {
    parts: PipelineParts,
    snapshots: Arc<SnapshotCell>,
    settings: LoopSettings,
}

/// Cloneable close trigger for signal handlers and the API thread.
#[derive(Clone, Debug, Default)]
pub struct PipelineCloser {
    stop: Arc<AtomicBool>,
}

impl PipelineCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub struct PipelineHandle {
    closer: PipelineCloser,
    join: JoinHandle<PipelineReport>,
}

impl PipelineHandle {
    pub fn close(&self) {
        self.closer.close();
    }

    pub fn closer(&self) -> PipelineCloser {
        self.closer.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<PipelineReport> {
        self.join
            .join()
            .map_err(|_| anyhow!("pipeline worker panicked"))
    }
}

impl PipelineLoop {
    pub fn new(parts: PipelineParts, snapshots: Arc<SnapshotCell>, settings: LoopSettings) -> Self {
        Self {
            parts,
            snapshots,
            settings,
        }
    }

    pub fn spawn(self) -> Result<PipelineHandle> {
        let closer = PipelineCloser::new();
        let worker_closer = closer.clone();
        let join = std::thread::Builder::new()
            .name("proximity-pipeline".to_string())
            .spawn(move || self.run(&worker_closer))?;
        Ok(PipelineHandle { closer, join })
    }

    /// Run on the current thread until an exit condition is met.
    pub fn run(self, closer: &PipelineCloser) -> PipelineReport {
        let PipelineLoop {
            parts,
            snapshots,
            settings,
        } = self;
        let PipelineParts {
            mut source,
            mut detector,
            mut processor,
            mut controller,
            mut effects,
        } = parts;

        let mut frames_processed = 0u64;
        let mut detector_failures = 0u64;
        let mut consecutive_failures = 0u32;
        let frame_budget = settings
            .target_fps
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps as f64));
        let started = Instant::now();
        let mut last_health_log = Instant::now();

        let exit = 'frames: {
            if let Err(e) = source.connect() {
                let err = ProximityError::CameraUnavailable(format!("{:#}", e));
                log::error!("{}", err);
                break 'frames PipelineExit::CameraUnavailable(err.to_string());
            }
            if let Err(e) = detector.warm_up() {
                log::warn!("detector {} warm-up failed: {:#}", detector.name(), e);
            }
            log::info!(
                "pipeline running: source={} detector={} threshold={:.2}",
                source.describe(),
                detector.name(),
                controller.threshold()
            );

            loop {
                if closer.is_closed() {
                    break 'frames PipelineExit::Closed;
                }
                let iteration_started = Instant::now();

                let frame = match source.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        log::info!("camera stream ended after {} frames", frames_processed);
                        break 'frames PipelineExit::EndOfStream;
                    }
                    Err(e) => {
                        let err = ProximityError::CameraUnavailable(format!("{:#}", e));
                        log::error!("{}", err);
                        break 'frames PipelineExit::CameraUnavailable(err.to_string());
                    }
                };

                let detections = match detector.detect(&frame) {
                    Ok(detections) => {
                        consecutive_failures = 0;
                        detections
                    }
                    Err(e) => {
                        detector_failures += 1;
                        consecutive_failures += 1;
                        let err = ProximityError::DetectorFailure(format!("{:#}", e));
                        log::warn!("{} (frame {} skipped)", err, frame.index);
                        if consecutive_failures >= settings.max_consecutive_detector_failures {
                            log::error!(
                                "detector failed {} frames in a row; stopping pipeline",
                                consecutive_failures
                            );
                            break 'frames PipelineExit::DetectorFailures(consecutive_failures);
                        }
                        continue;
                    }
                };

                let annotated = processor.process(&frame, detections);
                let step = controller.step(&annotated);
                effects.apply(&step);

                let jpeg = if settings.render {
                    match render_overlay(&frame, &annotated).and_then(|img| encode_jpeg(&img)) {
                        Ok(jpeg) => Some(jpeg),
                        Err(e) => {
                            log::warn!("overlay rendering failed for frame {}: {:#}", frame.index, e);
                            None
                        }
                    }
                } else {
                    None
                };
                snapshots.publish(PipelineSnapshot {
                    frame_index: frame.index,
                    frame_label: frame.label().map(str::to_string),
                    published_at: Local::now(),
                    alert_active: step.state.active,
                    alert_state_age_secs: step.state.since.elapsed().as_secs_f64(),
                    detections: annotated.into_iter().map(SnapshotDetection::from).collect(),
                    objects: controller
                        .objects()
                        .into_iter()
                        .map(|(label, state)| (label, state.distance))
                        .collect(),
                    jpeg,
                });
                frames_processed += 1;

                if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                    let fps = frames_processed as f64 / started.elapsed().as_secs_f64().max(1e-3);
                    log::info!(
                        "pipeline health frames={} fps={:.1} alert={} detector_failures={}",
                        frames_processed,
                        fps,
                        controller.state().active,
                        detector_failures
                    );
                    last_health_log = Instant::now();
                }

                if let Some(budget) = frame_budget {
                    let spent = iteration_started.elapsed();
                    if spent < budget {
                        std::thread::sleep(budget - spent);
                    }
                }
            }
        };

        effects.shutdown();
        drop(source);
        log::info!(
            "pipeline stopped: {:?} after {} frames ({} detector failures)",
            exit,
            frames_processed,
            detector_failures
        );
        PipelineReport {
            frames_processed,
            detector_failures,
            exit,
            effects: effects.stats(),
            processor: processor.stats(),
        }
    }
}
