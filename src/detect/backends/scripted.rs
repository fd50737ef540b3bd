use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::postprocess::filter_and_suppress;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Pre-recorded detector output.
///
/// `labels` answers frames that carry a matching label (reference images,
/// image-directory frames). Everything else is answered from `frames` by
/// frame index, cycling when `repeat` is set.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DetectionScript {
    #[serde(default)]
    pub labels: HashMap<String, Vec<Detection>>,
    #[serde(default)]
    pub frames: Vec<Vec<Detection>>,
    #[serde(default)]
    pub repeat: bool,
}

impl DetectionScript {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detection script {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid detection script {}", path.display()))
    }

    fn lookup(&self, frame: &Frame) -> Vec<Detection> {
        if let Some(found) = frame.label().and_then(|label| self.labels.get(label)) {
            return found.clone();
        }
        if self.frames.is_empty() {
            return Vec::new();
        }
        let idx = frame.index as usize;
        let slot = if self.repeat {
            Some(idx % self.frames.len())
        } else {
            (idx < self.frames.len()).then_some(idx)
        };
        slot.map(|i| self.frames[i].clone()).unwrap_or_default()
    }
}

/// Detector backend that replays a `DetectionScript`.
///
/// Used for demos, calibration fixtures and tests; it never looks at pixels.
pub struct ScriptedBackend {
    script: DetectionScript,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScriptedBackend {
    pub fn new(script: DetectionScript) -> Self {
        Self {
            script,
            confidence_threshold: 0.0,
            nms_threshold: 1.0,
        }
    }

    pub fn with_thresholds(mut self, confidence: f32, nms: f32) -> Self {
        self.confidence_threshold = confidence;
        self.nms_threshold = nms;
        self
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let raw = self.script.lookup(frame);
        Ok(filter_and_suppress(
            raw,
            self.confidence_threshold,
            self.nms_threshold,
        ))
    }
}
