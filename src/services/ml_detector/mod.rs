// Optional learned region detector.
//
// The backend is chosen once, when the analyzer is built: either a loaded
// model or the null detector. Callers only ever see `Option` results; model
// failures are logged and absorbed here.

#[cfg(feature = "onnx")]
pub mod onnx;

use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::core::config::AnalyzerConfig;
use crate::core::errors::{ModelError, ModelResult};
use crate::core::types::{
    Advisory, BoundingBox, CancelFlag, Detection, DetectionSource, PixelBuffer, RegionClass,
};

/// A learned detector producing region detections in input pixel space
pub trait RegionModel: Send + Sync {
    fn name(&self) -> &str;

    fn try_detect(&self, image: &PixelBuffer, threshold: f32) -> ModelResult<Vec<Detection>>;

    /// Like `try_detect`, but gives up with `ModelError::Cancelled` once
    /// `cancel` is set. Backends holding shared handles override this to
    /// stop waiting for them.
    fn try_detect_with_cancel(
        &self,
        image: &PixelBuffer,
        threshold: f32,
        cancel: &CancelFlag,
    ) -> ModelResult<Vec<Detection>> {
        if cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        self.try_detect(image, threshold)
    }
}

/// Raw tensors of a detection model with normalized `[y1, x1, y2, x2]` boxes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawModelOutput {
    pub boxes: Vec<f32>,
    pub scores: Vec<f32>,
    pub classes: Vec<i64>,
    pub valid_count: usize,
}

/// Turn raw model output into detections for a `width x height` image.
///
/// Entries below `threshold`, with unknown class ids or with an empty box
/// after clamping are dropped.
pub fn decode_raw_output(
    raw: &RawModelOutput,
    threshold: f32,
    width: u32,
    height: u32,
) -> ModelResult<Vec<Detection>> {
    let n = raw.valid_count;
    if raw.boxes.len() < n * 4 || raw.scores.len() < n || raw.classes.len() < n {
        return Err(ModelError::MalformedOutput(format!(
            "valid_count {} exceeds output lengths (boxes {}, scores {}, classes {})",
            n,
            raw.boxes.len(),
            raw.scores.len(),
            raw.classes.len()
        )));
    }

    let (w, h) = (width as f32, height as f32);
    let mut detections = Vec::new();
    for i in 0..n {
        let score = raw.scores[i];
        if !(score >= threshold) {
            continue;
        }
        let class = match RegionClass::from_model_label(raw.classes[i]) {
            Some(c) => c,
            None => {
                trace!("Dropping detection {} with unknown class id {}", i, raw.classes[i]);
                continue;
            }
        };

        let b = &raw.boxes[i * 4..i * 4 + 4];
        let bbox = BoundingBox::from_corners(b[1] * w, b[0] * h, b[3] * w, b[2] * h).clamped(w, h);
        if bbox.area() <= 0.0 {
            continue;
        }
        detections.push(Detection::new(bbox, score, class, DetectionSource::Ml));
    }
    Ok(detections)
}

#[derive(Clone)]
pub struct MlDetector {
    model: Option<Arc<dyn RegionModel>>,
}

impl MlDetector {
    /// Detector that never produces results
    pub fn null() -> Self {
        Self { model: None }
    }

    pub fn with_model(model: Arc<dyn RegionModel>) -> Self {
        Self { model: Some(model) }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn backend_name(&self) -> &str {
        self.model.as_ref().map_or("none", |m| m.name())
    }

    /// Model detections, or `None` when there is no model or it failed
    pub fn try_detect(&self, image: &PixelBuffer, threshold: f32) -> Option<Vec<Detection>> {
        self.try_detect_with_cancel(image, threshold, &CancelFlag::new())
    }

    pub fn try_detect_with_cancel(
        &self,
        image: &PixelBuffer,
        threshold: f32,
        cancel: &CancelFlag,
    ) -> Option<Vec<Detection>> {
        let model = self.model.as_ref()?;
        match model.try_detect_with_cancel(image, threshold, cancel) {
            Ok(detections) => {
                debug!("{}: {} detections", model.name(), detections.len());
                Some(detections)
            }
            Err(ModelError::Cancelled) => {
                debug!("{} cancelled", model.name());
                None
            }
            Err(e) => {
                warn!("{} failed, continuing without model detections: {}", model.name(), e);
                None
            }
        }
    }

    /// Load the configured model within `model_load_timeout`.
    ///
    /// Without a configured model the null detector is returned silently;
    /// a configured model that cannot be loaded yields the null detector and
    /// a `ModelUnavailable` advisory.
    pub async fn load(config: &AnalyzerConfig) -> (Self, Option<Advisory>) {
        let Some(path) = config.model_path.clone() else {
            info!("No detector model configured, heuristic detection only");
            return (Self::null(), None);
        };

        match Self::load_model(path, config).await {
            Ok(detector) => {
                info!("✓ Detector model loaded ({})", detector.backend_name());
                (detector, None)
            }
            Err(e) => {
                warn!("Detector model unavailable, heuristic detection only: {}", e);
                (
                    Self::null(),
                    Some(Advisory::ModelUnavailable {
                        reason: e.to_string(),
                    }),
                )
            }
        }
    }

    #[cfg(feature = "onnx")]
    async fn load_model(path: String, config: &AnalyzerConfig) -> ModelResult<Self> {
        let input_size = config.ml_input_size;
        let backend = config.inference_backend.clone();
        let pool_size = config.max_concurrent_pages.min(num_cpus::get()).max(1);

        let task = tokio::task::spawn_blocking(move || {
            onnx::OnnxRegionModel::from_file(&path, input_size, backend.as_deref(), pool_size)
        });

        match tokio::time::timeout(config.model_load_timeout, task).await {
            Ok(Ok(model)) => Ok(Self::with_model(Arc::new(model?))),
            Ok(Err(join_err)) => Err(ModelError::Unavailable(format!("loader task failed: {}", join_err))),
            Err(_) => Err(ModelError::LoadTimedOut(config.model_load_timeout.as_millis() as u64)),
        }
    }

    #[cfg(not(feature = "onnx"))]
    async fn load_model(path: String, _config: &AnalyzerConfig) -> ModelResult<Self> {
        Err(ModelError::Unavailable(format!(
            "cannot load {}: built without the `onnx` feature",
            path
        )))
    }
}

impl Default for MlDetector {
    fn default() -> Self {
        Self::null()
    }
}
