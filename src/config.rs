use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::DEFAULT_THRESHOLD_DISTANCE;
use crate::calibrate::ReferenceSpec;
use crate::distance::{ClassProfile, ClassTable, ReferenceGroup};
use crate::error::ProximityError;
use crate::storage::SinkWriterConfig;

const DEFAULT_DB_PATH: &str = "proximity.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8790";
const DEFAULT_CAMERA_SOURCE: &str = "stub://camera";
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.4;
const DEFAULT_NMS_THRESHOLD: f32 = 0.3;
const DEFAULT_INPUT_SIZE: u32 = 416;
const DEFAULT_MAX_DETECTOR_FAILURES: u32 = 5;
const DEFAULT_SINK_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_SINK_BACKOFF_MS: u64 = 50;
const DEFAULT_SINK_QUEUE_CAPACITY: usize = 256;

const CLASS_LABEL_PATTERN: &str = r"^[a-z0-9][a-z0-9 _-]{0,63}$";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ProximityConfigFile {
    threshold_distance: Option<f64>,
    calibration: Option<CalibrationConfigFile>,
    classes: Option<ClassesConfigFile>,
    detector: Option<DetectorConfigFile>,
    camera: Option<CameraConfigFile>,
    storage: Option<StorageConfigFile>,
    api: Option<ApiConfigFile>,
    alarm: Option<AlarmConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    sink: Option<SinkConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationConfigFile {
    references: Option<Vec<ReferenceSpec>>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassesConfigFile {
    tracked: Option<Vec<String>>,
    widths: Option<HashMap<String, ClassProfile>>,
    fallback: Option<ClassProfile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<DetectorKind>,
    script_path: Option<PathBuf>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AlarmConfigFile {
    command: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    max_consecutive_detector_failures: Option<u32>,
    stale_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkConfigFile {
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
    queue_capacity: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Scripted,
    Tract,
}

impl std::str::FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "scripted" => Ok(DetectorKind::Scripted),
            "tract" => Ok(DetectorKind::Tract),
            other => Err(anyhow!("unknown detector backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProximityConfig {
    pub threshold_distance: f64,
    pub references: Vec<ReferenceSpec>,
    pub classes: ClassTable,
    pub detector: DetectorSettings,
    pub camera: CameraSettings,
    pub db_path: String,
    pub api_addr: String,
    pub alarm_command: Option<Vec<String>>,
    pub pipeline: PipelineSettings,
    pub sink: SinkWriterConfig,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorKind,
    pub script_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub input_size: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DetectorKind::Scripted,
            script_path: None,
            model_path: None,
            labels_path: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub source: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            source: DEFAULT_CAMERA_SOURCE.to_string(),
            target_fps: DEFAULT_CAMERA_FPS,
            width: DEFAULT_CAMERA_WIDTH,
            height: DEFAULT_CAMERA_HEIGHT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_consecutive_detector_failures: u32,
    /// `None` keeps per-class distance state forever.
    pub stale_after: Option<Duration>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_consecutive_detector_failures: DEFAULT_MAX_DETECTOR_FAILURES,
            stale_after: None,
        }
    }
}

impl ProximityConfig {
    /// File from `PROXIMITY_CONFIG` (if set), then `PROXIMITY_*` env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PROXIMITY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ProximityConfigFile) -> Result<Self> {
        let threshold_distance = file
            .threshold_distance
            .unwrap_or(DEFAULT_THRESHOLD_DISTANCE);
        let references = file
            .calibration
            .and_then(|c| c.references)
            .unwrap_or_else(ReferenceSpec::defaults);

        let mut classes = ClassTable::road_safety();
        if let Some(file_classes) = file.classes {
            if let Some(fallback) = file_classes.fallback {
                let mut rebuilt = ClassTable::new(fallback);
                for (label, profile) in classes.profiles() {
                    rebuilt = rebuilt.with_profile(label, *profile);
                }
                rebuilt.set_tracked(classes.tracked().map(str::to_string));
                classes = rebuilt;
            }
            if let Some(widths) = file_classes.widths {
                for (label, profile) in widths {
                    classes = classes.with_profile(&normalize_label(&label), profile);
                }
            }
            if let Some(tracked) = file_classes.tracked {
                classes.set_tracked(tracked);
            }
        }

        let detector_file = file.detector.unwrap_or_default();
        let detector_defaults = DetectorSettings::default();
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(detector_defaults.backend),
            script_path: detector_file.script_path,
            model_path: detector_file.model_path,
            labels_path: detector_file.labels_path,
            confidence_threshold: detector_file
                .confidence_threshold
                .unwrap_or(detector_defaults.confidence_threshold),
            nms_threshold: detector_file
                .nms_threshold
                .unwrap_or(detector_defaults.nms_threshold),
            input_size: detector_file
                .input_size
                .unwrap_or(detector_defaults.input_size),
        };

        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            source: camera_file
                .source
                .unwrap_or_else(|| DEFAULT_CAMERA_SOURCE.to_string()),
            target_fps: camera_file.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
            width: camera_file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
        };

        let db_path = file
            .storage
            .and_then(|s| s.db_path)
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let alarm_command = file.alarm.and_then(|alarm| alarm.command);

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            max_consecutive_detector_failures: pipeline_file
                .max_consecutive_detector_failures
                .unwrap_or(DEFAULT_MAX_DETECTOR_FAILURES),
            stale_after: pipeline_file.stale_after_secs.map(Duration::from_secs),
        };

        let sink_file = file.sink.unwrap_or_default();
        let sink = SinkWriterConfig {
            max_attempts: sink_file.max_attempts.unwrap_or(DEFAULT_SINK_MAX_ATTEMPTS),
            backoff: Duration::from_millis(sink_file.backoff_ms.unwrap_or(DEFAULT_SINK_BACKOFF_MS)),
            queue_capacity: sink_file
                .queue_capacity
                .unwrap_or(DEFAULT_SINK_QUEUE_CAPACITY),
        };

        Ok(Self {
            threshold_distance,
            references,
            classes,
            detector,
            camera,
            db_path,
            api_addr,
            alarm_command,
            pipeline,
            sink,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(threshold) = std::env::var("PROXIMITY_THRESHOLD") {
            self.threshold_distance = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("PROXIMITY_THRESHOLD must be a number of inches"))?;
        }
        if let Ok(source) = std::env::var("PROXIMITY_CAMERA") {
            if !source.trim().is_empty() {
                self.camera.source = source;
            }
        }
        if let Ok(path) = std::env::var("PROXIMITY_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("PROXIMITY_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(backend) = std::env::var("PROXIMITY_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.parse()?;
            }
        }
        if let Ok(path) = std::env::var("PROXIMITY_DETECTION_SCRIPT") {
            if !path.trim().is_empty() {
                self.detector.script_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(classes) = std::env::var("PROXIMITY_TRACKED_CLASSES") {
            let parsed = split_csv(&classes);
            if !parsed.is_empty() {
                self.classes.set_tracked(parsed);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !self.threshold_distance.is_finite() || self.threshold_distance <= 0.0 {
            return Err(config_error("threshold_distance must be a positive number"));
        }
        check_unit_interval("detector.confidence_threshold", self.detector.confidence_threshold)?;
        check_unit_interval("detector.nms_threshold", self.detector.nms_threshold)?;
        if self.detector.input_size == 0 {
            return Err(config_error("detector.input_size must be greater than zero"));
        }
        if self.camera.target_fps == 0 {
            return Err(config_error("camera.target_fps must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(config_error("camera dimensions must be greater than zero"));
        }
        if self.pipeline.max_consecutive_detector_failures == 0 {
            return Err(config_error(
                "pipeline.max_consecutive_detector_failures must be at least 1",
            ));
        }
        if self.sink.max_attempts == 0 {
            return Err(config_error("sink.max_attempts must be at least 1"));
        }
        if self.sink.queue_capacity == 0 {
            return Err(config_error("sink.queue_capacity must be at least 1"));
        }
        if let Some(command) = &self.alarm_command {
            if command.first().map_or(true, |p| p.trim().is_empty()) {
                return Err(config_error("alarm.command must name a program"));
            }
        }

        for group in ReferenceGroup::ALL {
            let count = self.references.iter().filter(|r| r.group == group).count();
            if count != 1 {
                return Err(config_error(&format!(
                    "calibration needs exactly one reference for group {} (found {})",
                    group, count
                )));
            }
        }
        for reference in &self.references {
            if !(reference.known_distance > 0.0 && reference.known_width > 0.0) {
                return Err(config_error(&format!(
                    "reference for group {} needs positive known_distance and known_width",
                    reference.group
                )));
            }
        }

        let label_re = regex::Regex::new(CLASS_LABEL_PATTERN)?;
        let mut tracked: Vec<String> = Vec::new();
        for label in self.classes.tracked() {
            let normalized = normalize_label(label);
            check_label(&label_re, label, &normalized)?;
            tracked.push(normalized);
        }
        self.classes.set_tracked(tracked);
        for (label, _) in self.classes.profiles() {
            check_label(&label_re, label, label)?;
        }

        let fallback = self.classes.fallback();
        let widths = self
            .classes
            .profiles()
            .map(|(label, profile)| (label.to_string(), profile.width))
            .chain(std::iter::once(("fallback".to_string(), fallback.width)));
        for (label, width) in widths {
            if !width.is_finite() || width <= 0.0 {
                return Err(config_error(&format!(
                    "width for class '{}' must be positive",
                    label
                )));
            }
        }
        Ok(())
    }
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

fn check_label(label_re: &regex::Regex, raw: &str, normalized: &str) -> Result<()> {
    if !label_re.is_match(normalized) {
        return Err(config_error(&format!(
            "class label '{}' must match {}",
            raw, CLASS_LABEL_PATTERN
        )));
    }
    Ok(())
}

fn config_error(msg: &str) -> anyhow::Error {
    ProximityError::Config(msg.to_string()).into()
}

fn check_unit_interval(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(config_error(&format!("{} must be within [0, 1]", name)));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<ProximityConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
