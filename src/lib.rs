//! Proximity Kernel
//!
//! Estimates how far each detected object is from a single calibrated camera
//! and raises an edge-triggered alert when anything tracked comes closer than
//! a threshold.
//!
//! # Architecture
//!
//! 1. **Calibration** (`calibrate`): one reference image per reference group
//!    yields an immutable focal length at startup.
//! 2. **Distance** (`distance`): pinhole similar-triangles estimate and the
//!    class -> (group, real width) table.
//! 3. **Annotation** (`processor`): detector output becomes
//!    `AnnotatedDetection`s, in detector order, distances where measurable.
//! 4. **Alerting** (`alert`): a two-state controller emits start/stop edges
//!    and one `AlertEvent` per qualifying detection per frame.
//! 5. **Loop** (`pipeline`): a worker thread drives camera -> detector ->
//!    processor -> controller and publishes snapshots for readers.
//!
//! # Module Structure
//!
//! - `frame`, `ingest`: RGB frames and camera sources
//! - `detect`: detector trait, scripted and ONNX backends, NMS
//! - `storage`: append-only alert store and the background sink writer
//! - `audio`: alert sound devices
//! - `render`, `api`: overlay rendering and the loopback HTTP API
//! - `config`, `error`, `ui`: configuration, error kinds, CLI progress

pub mod alert;
pub mod api;
pub mod audio;
pub mod calibrate;
pub mod config;
pub mod detect;
pub mod distance;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod processor;
pub mod render;
pub mod storage;
pub mod ui;

pub use alert::{
    AlertEffects, AlertEvent, AlertPhase, AlertState, AlertStep, AlertTransition, EffectStats,
    ObjectState, ProximityAlertController, DEFAULT_THRESHOLD_DISTANCE,
};
pub use audio::{open_alarm, AlertDevice, CommandAlarm, LogAlarm};
pub use calibrate::{
    calibrate, calibrate_all, calibrate_reference, Calibration, CalibrationConstant,
    ReferenceSpec,
};
pub use config::{CameraSettings, DetectorKind, DetectorSettings, PipelineSettings, ProximityConfig};
pub use detect::{open_backend, BoundingBox, Detection, DetectionScript, DetectorBackend, ScriptedBackend};
pub use distance::{estimate, ClassProfile, ClassTable, ReferenceGroup};
pub use error::{ProximityError, ProximityResult};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource};
pub use pipeline::{
    LoopSettings, PipelineCloser, PipelineExit, PipelineHandle, PipelineLoop, PipelineParts,
    PipelineReport, PipelineSnapshot, SnapshotCell,
};
pub use processor::{Anchor, AnnotatedDetection, FrameProcessor};
pub use storage::{
    EventSink, InMemoryEventStore, SinkHandle, SinkStats, SinkWriter, SinkWriterConfig,
    SqliteEventStore,
};
