// Shape-based scoring and labelling of heuristic bubble candidates

use crate::core::types::RegionClass;
use crate::services::components::ShapeFeatures;

/// Confidence ceiling for heuristic candidates
pub const MAX_HEURISTIC_CONFIDENCE: f32 = 0.95;
/// Candidates smaller than this (px²) without other cues are sound effects
pub const SFX_MAX_AREA: f32 = 2000.0;

pub fn is_round(features: &ShapeFeatures) -> bool {
    features.compactness < 1.5 && features.convexity > 0.8
}

/// Heuristic confidence of a candidate, in `[0, MAX_HEURISTIC_CONFIDENCE]`
pub fn score(features: &ShapeFeatures) -> f32 {
    let mut confidence: f32 = 0.5;
    if is_round(features) {
        confidence += 0.2;
    }
    if features.has_tail {
        confidence += 0.2;
    }
    if (0.5..=2.0).contains(&features.aspect_ratio) {
        confidence += 0.1;
    }
    if features.fill_ratio > 0.3 && features.fill_ratio < 0.95 {
        confidence += 0.1;
    }
    if !features.is_valid_size {
        confidence *= 0.5;
    }
    confidence.min(MAX_HEURISTIC_CONFIDENCE)
}

pub fn classify(features: &ShapeFeatures) -> RegionClass {
    let round = is_round(features);
    if features.has_tail {
        RegionClass::SpeechBubble
    } else if round && features.fill_ratio > 0.7 {
        RegionClass::ThoughtBubble
    } else if !round && features.aspect_ratio > 1.5 {
        RegionClass::NarrationBox
    } else if features.area < SFX_MAX_AREA {
        RegionClass::SfxBubble
    } else {
        RegionClass::SpeechBubble
    }
}
