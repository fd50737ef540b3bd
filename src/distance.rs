//! Pinhole-camera distance estimation and the class → width table.
//!
//! `distance = real_width * focal_length / pixel_width`, where the focal length
//! comes from calibrating one reference object per `ReferenceGroup`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::{ProximityError, ProximityResult};

/// Distance at which both default reference images were captured (inches).
pub const KNOWN_DISTANCE_IN: f64 = 45.0;
pub const PERSON_WIDTH_IN: f64 = 16.0;
pub const MOBILE_WIDTH_IN: f64 = 3.0;
pub const VEHICLE_WIDTH_IN: f64 = 60.0;

/// Classes that receive a distance by default (road-safety vocabulary).
pub const DEFAULT_TRACKED_CLASSES: &[&str] = &[
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
];

/// Objects sharing one calibrated focal length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceGroup {
    Person,
    SmallObject,
}

impl ReferenceGroup {
    pub const ALL: [ReferenceGroup; 2] = [ReferenceGroup::Person, ReferenceGroup::SmallObject];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceGroup::Person => "person",
            ReferenceGroup::SmallObject => "small-object",
        }
    }
}

impl std::fmt::Display for ReferenceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimate distance from a pixel width. Same unit as `real_object_width`.
pub fn estimate(
    focal_length: f64,
    real_object_width: f64,
    pixel_width: f64,
) -> ProximityResult<f64> {
    if !pixel_width.is_finite() || pixel_width <= 0.0 {
        return Err(ProximityError::InvalidMeasurement { pixel_width });
    }
    let distance = real_object_width * focal_length / pixel_width;
    if !distance.is_finite() {
        return Err(ProximityError::InvalidMeasurement { pixel_width });
    }
    Ok(distance)
}

/// Real-world width of a class and the focal length group it borrows.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassProfile {
    pub group: ReferenceGroup,
    pub width: f64,
}

/// Fixed class → profile mapping plus the set of classes that get distances.
///
/// Tracked classes without an explicit profile use the small-object fallback.
/// That is a coarse approximation: a bus measured as a 3-inch object reads as
/// far closer than it is. Give safety-relevant classes explicit widths.
#[derive(Clone, Debug)]
pub struct ClassTable {
    tracked: BTreeSet<String>,
    profiles: HashMap<String, ClassProfile>,
    fallback: ClassProfile,
}

impl ClassTable {
    pub fn new(fallback: ClassProfile) -> Self {
        Self {
            tracked: BTreeSet::new(),
            profiles: HashMap::new(),
            fallback,
        }
    }

    /// Person and car widths, small-object fallback, road-safety tracked set.
    pub fn road_safety() -> Self {
        let mut table = Self::new(ClassProfile {
            group: ReferenceGroup::SmallObject,
            width: MOBILE_WIDTH_IN,
        });
        // Vehicles borrow the person focal length; only their width differs.
        table = table
            .with_profile(
                "person",
                ClassProfile {
                    group: ReferenceGroup::Person,
                    width: PERSON_WIDTH_IN,
                },
            )
            .with_profile(
                "car",
                ClassProfile {
                    group: ReferenceGroup::Person,
                    width: VEHICLE_WIDTH_IN,
                },
            );
        table.set_tracked(DEFAULT_TRACKED_CLASSES.iter().map(|s| s.to_string()));
        table
    }

    pub fn with_profile(mut self, class_label: &str, profile: ClassProfile) -> Self {
        self.profiles.insert(class_label.to_string(), profile);
        self
    }

    pub fn set_tracked<I: IntoIterator<Item = String>>(&mut self, classes: I) {
        self.tracked = classes.into_iter().collect();
    }

    pub fn is_tracked(&self, class_label: &str) -> bool {
        self.tracked.contains(class_label)
    }

    pub fn tracked(&self) -> impl Iterator<Item = &str> {
        self.tracked.iter().map(String::as_str)
    }

    pub fn profile(&self, class_label: &str) -> ClassProfile {
        self.profiles
            .get(class_label)
            .copied()
            .unwrap_or(self.fallback)
    }

    pub fn has_explicit_profile(&self, class_label: &str) -> bool {
        self.profiles.contains_key(class_label)
    }

    pub fn profiles(&self) -> impl Iterator<Item = (&str, &ClassProfile)> {
        self.profiles.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn fallback(&self) -> ClassProfile {
        self.fallback
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::road_safety()
    }
}
