//! Focal-length calibration from reference images.
//!
//! Each `ReferenceGroup` is calibrated once at startup from a single image of
//! a known object at a known distance. The resulting `Calibration` is
//! immutable for the lifetime of the process: no drift correction, no
//! periodic recalibration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::detect::{Detection, DetectorBackend};
use crate::distance::{
    ReferenceGroup, KNOWN_DISTANCE_IN, MOBILE_WIDTH_IN, PERSON_WIDTH_IN,
};
use crate::error::{ProximityError, ProximityResult};
use crate::frame::Frame;

/// Where and how one reference image was captured.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSpec {
    pub group: ReferenceGroup,
    pub image: PathBuf,
    pub known_distance: f64,
    pub known_width: f64,
    pub expected_class: String,
}

impl ReferenceSpec {
    /// Reference images shipped with the original deployment.
    pub fn defaults() -> Vec<ReferenceSpec> {
        vec![
            ReferenceSpec {
                group: ReferenceGroup::Person,
                image: PathBuf::from("ReferenceImages/image14.png"),
                known_distance: KNOWN_DISTANCE_IN,
                known_width: PERSON_WIDTH_IN,
                expected_class: "person".to_string(),
            },
            ReferenceSpec {
                group: ReferenceGroup::SmallObject,
                image: PathBuf::from("ReferenceImages/image4.png"),
                known_distance: KNOWN_DISTANCE_IN,
                known_width: MOBILE_WIDTH_IN,
                expected_class: "cell phone".to_string(),
            },
        ]
    }
}

/// Focal length derived for one reference group.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CalibrationConstant {
    reference_group: ReferenceGroup,
    known_distance: f64,
    known_width: f64,
    reference_pixel_width: f64,
    focal_length: f64,
}

impl CalibrationConstant {
    /// `focal_length = reference_pixel_width * known_distance / known_width`.
    pub fn derive(
        reference_group: ReferenceGroup,
        known_distance: f64,
        known_width: f64,
        reference_pixel_width: f64,
    ) -> ProximityResult<Self> {
        for (name, value) in [
            ("known_distance", known_distance),
            ("known_width", known_width),
            ("reference_pixel_width", reference_pixel_width),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ProximityError::Calibration(format!(
                    "{} for group {} must be positive, got {}",
                    name, reference_group, value
                )));
            }
        }
        Ok(Self {
            reference_group,
            known_distance,
            known_width,
            reference_pixel_width,
            focal_length: reference_pixel_width * known_distance / known_width,
        })
    }

    pub fn reference_group(&self) -> ReferenceGroup {
        self.reference_group
    }

    pub fn known_distance(&self) -> f64 {
        self.known_distance
    }

    pub fn known_width(&self) -> f64 {
        self.known_width
    }

    pub fn reference_pixel_width(&self) -> f64 {
        self.reference_pixel_width
    }

    pub fn focal_length(&self) -> f64 {
        self.focal_length
    }
}

/// Highest-confidence detection of `expected_class`; ties go to the wider box.
pub fn select_reference<'a>(
    detections: &'a [Detection],
    expected_class: &str,
) -> Option<&'a Detection> {
    detections
        .iter()
        .filter(|d| d.class_label == expected_class)
        .max_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then(a.bbox.width.total_cmp(&b.bbox.width))
        })
}

/// Calibrate one group from an already decoded reference frame.
pub fn calibrate<D: DetectorBackend + ?Sized>(
    detector: &mut D,
    reference: &Frame,
    group: ReferenceGroup,
    known_distance: f64,
    known_width: f64,
    expected_class: &str,
) -> ProximityResult<CalibrationConstant> {
    let detections = detector.detect(reference).map_err(|e| {
        ProximityError::Calibration(format!(
            "detector {} failed on reference image for group {}: {:#}",
            detector.name(),
            group,
            e
        ))
    })?;

    let Some(found) = select_reference(&detections, expected_class) else {
        return Err(ProximityError::Calibration(format!(
            "no '{}' detected in reference image for group {} ({} other detections)",
            expected_class,
            group,
            detections.len()
        )));
    };

    let constant =
        CalibrationConstant::derive(group, known_distance, known_width, found.pixel_width())?;
    log::info!(
        "calibrated group {}: '{}' {:.1}px wide at {} -> focal length {:.2}",
        group,
        expected_class,
        constant.reference_pixel_width(),
        known_distance,
        constant.focal_length()
    );
    Ok(constant)
}

/// Load a reference image from disk and calibrate its group.
pub fn calibrate_reference<D: DetectorBackend + ?Sized>(
    detector: &mut D,
    spec: &ReferenceSpec,
) -> ProximityResult<CalibrationConstant> {
    let frame = Frame::open(&spec.image, 0).map_err(|e| {
        ProximityError::Calibration(format!(
            "cannot load reference image {} for group {}: {:#}",
            spec.image.display(),
            spec.group,
            e
        ))
    })?;
    calibrate(
        detector,
        &frame,
        spec.group,
        spec.known_distance,
        spec.known_width,
        &spec.expected_class,
    )
}

/// Immutable set of focal lengths, exactly one per `ReferenceGroup`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Calibration {
    person: CalibrationConstant,
    small_object: CalibrationConstant,
}

impl Calibration {
    pub fn from_constants<I: IntoIterator<Item = CalibrationConstant>>(
        constants: I,
    ) -> ProximityResult<Self> {
        let mut person = None;
        let mut small_object = None;
        for constant in constants {
            let slot = match constant.reference_group() {
                ReferenceGroup::Person => &mut person,
                ReferenceGroup::SmallObject => &mut small_object,
            };
            if slot.replace(constant).is_some() {
                return Err(ProximityError::Calibration(format!(
                    "group {} calibrated more than once",
                    constant.reference_group()
                )));
            }
        }
        match (person, small_object) {
            (Some(person), Some(small_object)) => Ok(Self {
                person,
                small_object,
            }),
            (None, _) => Err(ProximityError::Calibration(
                "missing reference for group person".to_string(),
            )),
            (_, None) => Err(ProximityError::Calibration(
                "missing reference for group small-object".to_string(),
            )),
        }
    }

    pub fn get(&self, group: ReferenceGroup) -> &CalibrationConstant {
        match group {
            ReferenceGroup::Person => &self.person,
            ReferenceGroup::SmallObject => &self.small_object,
        }
    }

    pub fn focal_length(&self, group: ReferenceGroup) -> f64 {
        self.get(group).focal_length()
    }

    pub fn constants(&self) -> [&CalibrationConstant; 2] {
        [&self.person, &self.small_object]
    }
}

/// Calibrate every configured reference. Any failure is fatal.
pub fn calibrate_all<D: DetectorBackend + ?Sized>(
    detector: &mut D,
    specs: &[ReferenceSpec],
) -> ProximityResult<Calibration> {
    let constants = specs
        .iter()
        .map(|spec| calibrate_reference(detector, spec))
        .collect::<ProximityResult<Vec<_>>>()?;
    Calibration::from_constants(constants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, DetectionScript, ScriptedBackend};

    fn reference_frame() -> Frame {
        Frame::new(vec![0u8; 12], 2, 2, 0)
            .unwrap()
            .with_label("image14.png")
    }

    fn scripted(detections: Vec<Detection>) -> ScriptedBackend {
        let mut script = DetectionScript::default();
        script.labels.insert("image14.png".into(), detections);
        ScriptedBackend::new(script)
    }

    fn det(label: &str, confidence: f32, width: f32) -> Detection {
        Detection::new(label, confidence, BoundingBox::new(5.0, 5.0, width, 250.0))
    }

    #[test]
    fn single_match_gives_exact_focal_length() {
        let mut detector = scripted(vec![det("person", 0.9, 136.0)]);
        let c = calibrate(
            &mut detector,
            &reference_frame(),
            ReferenceGroup::Person,
            45.0,
            16.0,
            "person",
        )
        .unwrap();
        assert!((c.focal_length() - 136.0 * 45.0 / 16.0).abs() < 1e-9);
        assert!((c.focal_length() - 382.5).abs() < 1e-9);
    }

    #[test]
    fn zero_matches_is_a_calibration_error() {
        let mut detector = scripted(vec![det("chair", 0.9, 80.0)]);
        let err = calibrate(
            &mut detector,
            &reference_frame(),
            ReferenceGroup::Person,
            45.0,
            16.0,
            "person",
        )
        .unwrap_err();
        assert!(matches!(err, ProximityError::Calibration(_)));
    }

    #[test]
    fn picks_highest_confidence_regardless_of_order() {
        let detections = vec![
            det("person", 0.55, 300.0),
            det("cell phone", 0.99, 20.0),
            det("person", 0.95, 136.0),
        ];
        let chosen = select_reference(&detections, "person").unwrap();
        assert_eq!(chosen.bbox.width, 136.0);

        let mut reversed = detections.clone();
        reversed.reverse();
        let chosen = select_reference(&reversed, "person").unwrap();
        assert_eq!(chosen.bbox.width, 136.0);
    }

    #[test]
    fn calibration_requires_every_group_once() {
        let person = CalibrationConstant::derive(ReferenceGroup::Person, 45.0, 16.0, 136.0).unwrap();
        let small =
            CalibrationConstant::derive(ReferenceGroup::SmallObject, 45.0, 3.0, 30.0).unwrap();

        assert!(Calibration::from_constants([person]).is_err());
        assert!(Calibration::from_constants([person, person, small]).is_err());
        let cal = Calibration::from_constants([small, person]).unwrap();
        assert!((cal.focal_length(ReferenceGroup::SmallObject) - 450.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_non_positive_inputs() {
        assert!(CalibrationConstant::derive(ReferenceGroup::Person, 0.0, 16.0, 136.0).is_err());
        assert!(CalibrationConstant::derive(ReferenceGroup::Person, 45.0, -1.0, 136.0).is_err());
        assert!(CalibrationConstant::derive(ReferenceGroup::Person, 45.0, 16.0, 0.0).is_err());
    }

    #[test]
    fn missing_reference_image_fails_calibration() {
        let mut detector = scripted(vec![]);
        let spec = ReferenceSpec {
            group: ReferenceGroup::Person,
            image: PathBuf::from("/nonexistent/reference.png"),
            known_distance: 45.0,
            known_width: 16.0,
            expected_class: "person".into(),
        };
        let err = calibrate_reference(&mut detector, &spec).unwrap_err();
        assert!(matches!(err, ProximityError::Calibration(_)));
    }
}
