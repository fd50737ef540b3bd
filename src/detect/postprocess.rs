use crate::detect::result::Detection;

/// Drop low-confidence detections, then run per-class non-maximum suppression.
///
/// Survivors are returned highest-confidence first. Two boxes of different
/// classes never suppress each other.
pub fn filter_and_suppress(
    detections: Vec<Detection>,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Vec<Detection> {
    let mut candidates: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.confidence >= confidence_threshold)
        .collect();
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_label == candidate.class_label && k.bbox.iou(&candidate.bbox) > nms_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
