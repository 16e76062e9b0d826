// Merging of model and heuristic detections, NMS and final ordering

use tracing::{debug, trace};

use crate::core::config::ProcessingOptions;
use crate::core::types::{BoundingBox, Detection, DetectionSource, RegionClass};

/// Heuristic detections overlapping a model detection at least this much
/// are duplicates
pub const MERGE_IOU_THRESHOLD: f32 = 0.5;

/// A bright region this close to a panel frame is the panel's own interior
pub const PANEL_INTERIOR_IOU: f32 = 0.9;

pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    a.iou(b)
}

/// Keep every model detection and the heuristic ones that do not duplicate
/// any of them
pub fn merge_detections(ml: Vec<Detection>, heuristic: Vec<Detection>) -> Vec<Detection> {
    let ml_count = ml.len();
    let mut merged = ml;
    let mut dropped = 0usize;

    for candidate in heuristic {
        let duplicate = merged[..ml_count]
            .iter()
            .any(|m| m.iou(&candidate) >= MERGE_IOU_THRESHOLD);
        if duplicate {
            dropped += 1;
        } else {
            merged.push(candidate);
        }
    }

    debug!(
        "Merged {} ML + {} heuristic detections ({} duplicates dropped)",
        ml_count,
        merged.len() - ml_count,
        dropped
    );
    merged
}

/// Remove bubble candidates that are just the paper inside a detected panel
pub fn drop_panel_interiors(candidates: Vec<Detection>, panels: &[Detection]) -> Vec<Detection> {
    let before = candidates.len();
    let kept: Vec<Detection> = candidates
        .into_iter()
        .filter(|c| !panels.iter().any(|p| p.iou(c) > PANEL_INTERIOR_IOU))
        .collect();
    if kept.len() < before {
        trace!("Dropped {} panel interiors", before - kept.len());
    }
    kept
}

/// Greedy non-maximum suppression.
///
/// Detections are visited by descending confidence; one is kept unless its
/// IoU with an already kept detection exceeds `threshold`. Equal confidences
/// keep their input order.
pub fn non_max_suppression(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        match kept.iter().find(|k| k.iou(&candidate) > threshold) {
            Some(winner) => trace!(
                "NMS: {:?} ({:.2}) suppressed by {:?} ({:.2})",
                candidate.class,
                candidate.confidence,
                winner.class,
                winner.confidence
            ),
            None => kept.push(candidate),
        }
    }
    kept
}

pub fn confidence_threshold(source: DetectionSource, options: &ProcessingOptions) -> f32 {
    match source {
        DetectionSource::Ml => options.ml_confidence_threshold,
        DetectionSource::Heuristic => options.heuristic_confidence_threshold,
    }
}

/// Confidence filter, class-priority order, truncation and id assignment.
///
/// The sort is stable, so panels keep whatever order they arrive in.
/// Panels are dropped entirely when panel detection is disabled.
pub fn finalize(detections: Vec<Detection>, options: &ProcessingOptions) -> Vec<Detection> {
    let mut out: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.confidence >= confidence_threshold(d.source, options))
        .filter(|d| options.enable_panel_detection || d.class != RegionClass::Panel)
        .collect();

    out.sort_by_key(|d| d.class.priority());
    out.truncate(options.max_detections);

    for (i, detection) in out.iter_mut().enumerate() {
        let bbox = detection.bbox();
        let (cx, cy) = bbox.center();
        detection.id = i as u32;
        detection.center_x = cx;
        detection.center_y = cy;
    }
    out
}
