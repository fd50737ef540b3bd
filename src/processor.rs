use serde::Serialize;
use std::collections::HashSet;

use crate::calibrate::Calibration;
use crate::detect::Detection;
use crate::distance::{estimate, ClassTable};
use crate::frame::Frame;

/// Vertical offset of the distance badge above the box's top edge.
const ANCHOR_OFFSET_PX: f32 = 2.0;

/// Overlay placement point. Carries no meaning beyond rendering.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Anchor {
    pub x: f32,
    pub y: f32,
}

/// A detection with its estimated distance, valid for one frame only.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnnotatedDetection {
    #[serde(flatten)]
    pub detection: Detection,
    /// Absent for untracked classes and invalid measurements.
    pub distance: Option<f64>,
    pub anchor: Anchor,
}

impl AnnotatedDetection {
    pub fn class_label(&self) -> &str {
        &self.detection.class_label
    }

    pub fn label_text(&self) -> String {
        format!(
            "{} : {:.2}",
            self.detection.class_label, self.detection.confidence
        )
    }

    pub fn distance_text(&self) -> Option<String> {
        self.distance.map(|d| format!("Dis: {:.2} inch", d))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub detections: u64,
    pub measured: u64,
    pub invalid_measurements: u64,
}

/// Turns raw detector output into annotated detections.
pub struct FrameProcessor {
    calibration: Calibration,
    classes: ClassTable,
    stats: ProcessorStats,
    fallback_noted: HashSet<String>,
}

impl FrameProcessor {
    pub fn new(calibration: Calibration, classes: ClassTable) -> Self {
        Self {
            calibration,
            classes,
            stats: ProcessorStats::default(),
            fallback_noted: HashSet::new(),
        }
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }

    /// Annotate in detector order. Nothing is dropped, reordered or merged.
    pub fn process(&mut self, frame: &Frame, detections: Vec<Detection>) -> Vec<AnnotatedDetection> {
        detections
            .into_iter()
            .map(|detection| {
                self.stats.detections += 1;
                let distance = self.distance_for(&detection);
                let anchor = anchor_for(frame, &detection);
                AnnotatedDetection {
                    detection,
                    distance,
                    anchor,
                }
            })
            .collect()
    }

    fn distance_for(&mut self, detection: &Detection) -> Option<f64> {
        let label = detection.class_label.as_str();
        if !self.classes.is_tracked(label) {
            return None;
        }
        if !self.classes.has_explicit_profile(label) && self.fallback_noted.insert(label.to_string())
        {
            log::debug!(
                "class '{}' has no width profile; using small-object fallback",
                label
            );
        }
        let profile = self.classes.profile(label);
        let focal_length = self.calibration.focal_length(profile.group);
        match estimate(focal_length, profile.width, detection.pixel_width()) {
            Ok(distance) => {
                self.stats.measured += 1;
                Some(distance)
            }
            Err(e) => {
                self.stats.invalid_measurements += 1;
                log::debug!("frame detection '{}' has no distance: {}", label, e);
                None
            }
        }
    }
}

fn anchor_for(frame: &Frame, detection: &Detection) -> Anchor {
    let bbox = &detection.bbox;
    Anchor {
        x: bbox.x.clamp(0.0, frame.width as f32),
        y: (bbox.y - ANCHOR_OFFSET_PX).max(0.0),
    }
}
