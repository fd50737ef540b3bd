use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proximity_kernel::ingest::SyntheticSource;
use proximity_kernel::{
    calibrate, AlertDevice, AlertEffects, BoundingBox, Calibration, ClassTable, Detection,
    DetectionScript, DetectorBackend, Frame, FrameProcessor, FrameSource, InMemoryEventStore,
    LoopSettings, PipelineCloser, PipelineExit, PipelineLoop, PipelineParts, PipelineReport,
    ProximityAlertController, ReferenceGroup, ScriptedBackend, SinkWriter, SinkWriterConfig,
    SnapshotCell,
};

const WIDTH: u32 = 32;
const HEIGHT: u32 = 24;

fn person(pixel_width: f32) -> Detection {
    Detection::new("person", 0.9, BoundingBox::new(2.0, 4.0, pixel_width, 10.0))
}

fn reference_frame(label: &str) -> Result<Frame> {
    Ok(Frame::new(vec![0u8; (WIDTH * HEIGHT * 3) as usize], WIDTH, HEIGHT, 0)?.with_label(label))
}

/// Person: 136 px at 45 in, 16 in wide -> focal length 382.5.
fn calibrated() -> Result<Calibration> {
    let mut labels = HashMap::new();
    labels.insert("person.png".to_string(), vec![person(136.0)]);
    labels.insert(
        "phone.png".to_string(),
        vec![Detection::new(
            "cell phone",
            0.8,
            BoundingBox::new(0.0, 0.0, 30.0, 50.0),
        )],
    );
    let mut detector = ScriptedBackend::new(DetectionScript {
        labels,
        ..DetectionScript::default()
    });
    let person = calibrate(
        &mut detector,
        &reference_frame("person.png")?,
        ReferenceGroup::Person,
        45.0,
        16.0,
        "person",
    )?;
    let phone = calibrate(
        &mut detector,
        &reference_frame("phone.png")?,
        ReferenceGroup::SmallObject,
        45.0,
        3.0,
        "cell phone",
    )?;
    Ok(Calibration::from_constants([person, phone])?)
}

#[derive(Clone, Default)]
struct RecordingAlarm {
    calls: Arc<Mutex<Vec<&'static str>>>,
    active: bool,
}

impl RecordingAlarm {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl AlertDevice for RecordingAlarm {
    fn start(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push("start");
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.active {
            self.calls.lock().unwrap().push("stop");
        }
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

struct Harness {
    store: InMemoryEventStore,
    alarm: RecordingAlarm,
    snapshots: Arc<SnapshotCell>,
    writer: SinkWriter,
}

impl Harness {
    fn new() -> Result<Self> {
        let store = InMemoryEventStore::new();
        let writer = SinkWriter::spawn(Box::new(store.clone()), SinkWriterConfig::default())?;
        Ok(Self {
            store,
            alarm: RecordingAlarm::default(),
            snapshots: Arc::new(SnapshotCell::new()),
            writer,
        })
    }

    fn pipeline(
        &self,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        max_failures: u32,
    ) -> Result<PipelineLoop> {
        let parts = PipelineParts {
            source,
            detector,
            processor: FrameProcessor::new(calibrated()?, ClassTable::road_safety()),
            controller: ProximityAlertController::new(25.0),
            effects: AlertEffects::new(Box::new(self.alarm.clone()), self.writer.handle()),
        };
        let settings = LoopSettings {
            target_fps: None,
            max_consecutive_detector_failures: max_failures,
            render: true,
        };
        Ok(PipelineLoop::new(parts, self.snapshots.clone(), settings))
    }

    fn run(
        &self,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
    ) -> Result<PipelineReport> {
        Ok(self.pipeline(source, detector, 5)?.run(&PipelineCloser::new()))
    }
}

fn scripted_frames(frames: Vec<Vec<Detection>>) -> Box<dyn DetectorBackend> {
    Box::new(
        ScriptedBackend::new(DetectionScript {
            frames,
            ..DetectionScript::default()
        })
        .with_thresholds(0.4, 0.3),
    )
}

fn synthetic(frames: u64) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(SyntheticSource::new("test", WIDTH, HEIGHT, Some(frames))?))
}

#[test]
fn calibrated_person_at_61_inches_does_not_alert() -> Result<()> {
    let calibration = calibrated()?;
    assert!((calibration.focal_length(ReferenceGroup::Person) - 382.5).abs() < 1e-9);

    let harness = Harness::new()?;
    let report = harness.run(synthetic(1)?, scripted_frames(vec![vec![person(100.0)]]))?;
    assert_eq!(report.exit, PipelineExit::EndOfStream);
    assert_eq!(report.frames_processed, 1);

    let snapshot = harness.snapshots.latest().expect("snapshot published");
    assert!(!snapshot.alert_active);
    let distance = snapshot.detections[0].annotated.distance.expect("measured");
    assert!((distance - 61.2).abs() < 1e-9);
    assert_eq!(
        snapshot.detections[0].distance_text.as_deref(),
        Some("Dis: 61.20 inch")
    );
    assert!(snapshot.jpeg.is_some());

    let Harness { store, alarm, writer, .. } = harness;
    writer.finish()?;
    assert!(store.is_empty());
    assert!(alarm.calls().is_empty());
    Ok(())
}

#[test]
fn approach_and_retreat_alerts_once() -> Result<()> {
    // 6120 / px = distance in inches with f = 382.5 and a 16 in person.
    let distances = [40.0, 30.0, 20.0, 30.0, 40.0];
    let frames = distances
        .iter()
        .map(|d| vec![person((6120.0 / d) as f32)])
        .collect();

    let harness = Harness::new()?;
    let report = harness.run(synthetic(5)?, scripted_frames(frames))?;
    assert_eq!(report.frames_processed, 5);
    assert_eq!(report.effects.starts, 1);
    assert_eq!(report.effects.stops, 1);

    let Harness { store, alarm, writer, .. } = harness;
    let stats = writer.finish()?;
    assert_eq!(stats.written, 1);
    let events = store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].class_label, "person");
    assert!((events[0].distance - 20.0).abs() < 1e-9);
    assert_eq!(alarm.calls(), vec!["start", "stop"]);
    Ok(())
}

#[test]
fn sink_outage_never_blocks_the_alert() -> Result<()> {
    let harness = Harness::new()?;
    harness.store.fail_next(u32::MAX);
    // 306 px -> 20 in on both frames.
    let report = harness.run(
        synthetic(2)?,
        scripted_frames(vec![vec![person(306.0)], vec![person(306.0)]]),
    )?;
    assert_eq!(report.exit, PipelineExit::EndOfStream);
    assert_eq!(report.frames_processed, 2);
    assert_eq!(report.effects.starts, 1);
    assert_eq!(report.effects.events_queued, 2);

    let snapshot = harness.snapshots.latest().expect("snapshot published");
    assert!(snapshot.alert_active);

    let Harness { store, alarm, writer, .. } = harness;
    let stats = writer.finish()?;
    assert_eq!(stats.written, 0);
    assert_eq!(stats.dropped, 2);
    assert!(store.is_empty());
    assert_eq!(alarm.calls().first(), Some(&"start"));
    Ok(())
}

struct ClosingSource {
    inner: SyntheticSource,
    closer: PipelineCloser,
    close_on_call: usize,
    calls: Arc<AtomicUsize>,
    dropped: Arc<AtomicBool>,
}

impl FrameSource for ClosingSource {
    fn describe(&self) -> String {
        "closing test source".to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.close_on_call {
            self.closer.close();
        }
        self.inner.next_frame()
    }
}

impl Drop for ClosingSource {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[test]
fn close_mid_iteration_stops_before_next_acquisition() -> Result<()> {
    let closer = PipelineCloser::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicBool::new(false));
    let source = ClosingSource {
        inner: SyntheticSource::new("endless", WIDTH, HEIGHT, None)?,
        closer: closer.clone(),
        close_on_call: 3,
        calls: calls.clone(),
        dropped: dropped.clone(),
    };

    let harness = Harness::new()?;
    let pipeline = harness.pipeline(
        Box::new(source),
        scripted_frames(vec![vec![person(100.0)]]),
        5,
    )?;
    let report = pipeline.run(&closer);

    assert_eq!(report.exit, PipelineExit::Closed);
    assert_eq!(report.frames_processed, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(dropped.load(Ordering::SeqCst), "camera released on exit");
    Ok(())
}

#[test]
fn spawned_pipeline_closes_on_request() -> Result<()> {
    let harness = Harness::new()?;
    let source = Box::new(SyntheticSource::new("endless", WIDTH, HEIGHT, None)?);
    let pipeline = harness.pipeline(source, scripted_frames(vec![vec![person(100.0)]]), 5)?;
    let handle = pipeline.spawn()?;
    handle.close();
    let report = handle.join()?;
    assert_eq!(report.exit, PipelineExit::Closed);
    Ok(())
}

struct FlakyDetector {
    /// `true` entries fail, cycled per call.
    pattern: Vec<bool>,
    calls: usize,
}

impl DetectorBackend for FlakyDetector {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        let fail = self.pattern[self.calls % self.pattern.len()];
        self.calls += 1;
        if fail {
            Err(anyhow!("inference backend crashed"))
        } else {
            Ok(vec![person(306.0)])
        }
    }
}

#[test]
fn consecutive_detector_failures_end_the_loop() -> Result<()> {
    let harness = Harness::new()?;
    let detector = Box::new(FlakyDetector {
        pattern: vec![true],
        calls: 0,
    });
    let report = harness
        .pipeline(synthetic(100)?, detector, 3)?
        .run(&PipelineCloser::new());

    assert_eq!(report.exit, PipelineExit::DetectorFailures(3));
    assert_eq!(report.detector_failures, 3);
    assert_eq!(report.frames_processed, 0);
    assert!(harness.snapshots.latest().is_none());
    Ok(())
}

#[test]
fn isolated_detector_failures_skip_frames_only() -> Result<()> {
    let harness = Harness::new()?;
    let detector = Box::new(FlakyDetector {
        pattern: vec![false, true],
        calls: 0,
    });
    let report = harness
        .pipeline(synthetic(6)?, detector, 2)?
        .run(&PipelineCloser::new());

    assert_eq!(report.exit, PipelineExit::EndOfStream);
    assert_eq!(report.frames_processed, 3);
    assert_eq!(report.detector_failures, 3);
    // 306 px -> 20 in: alert starts once and stays on across skipped frames.
    assert_eq!(report.effects.starts, 1);
    assert_eq!(report.effects.stops, 0);

    let Harness { store, alarm, writer, .. } = harness;
    writer.finish()?;
    assert_eq!(store.len(), 3);
    // the device is silenced on shutdown
    assert_eq!(alarm.calls(), vec!["start", "stop"]);
    Ok(())
}

struct BrokenCamera;

impl FrameSource for BrokenCamera {
    fn describe(&self) -> String {
        "broken".to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Err(anyhow!("device unplugged"))
    }
}

#[test]
fn camera_failure_terminates_without_retry() -> Result<()> {
    let harness = Harness::new()?;
    let report = harness.run(Box::new(BrokenCamera), scripted_frames(vec![]))?;
    match report.exit {
        PipelineExit::CameraUnavailable(reason) => assert!(reason.contains("device unplugged")),
        other => panic!("unexpected exit {:?}", other),
    }
    assert_eq!(report.frames_processed, 0);
    Ok(())
}
