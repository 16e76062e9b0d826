// ONNX Runtime backend for the region detector

use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;
use std::time::Instant;
use tracing::{debug, info, trace};

use super::{decode_raw_output, RawModelOutput, RegionModel};
use crate::core::errors::{ModelError, ModelResult};
use crate::core::types::{CancelFlag, Detection, PixelBuffer};
use crate::services::onnx_builder::{build_session_with_acceleration, OnnxSessionPool};

/// Detector exported with a single `images` input ([1, 3, S, S], RGB in
/// [0, 1]) and `boxes` / `scores` / `classes` / `valid_detections` outputs
pub struct OnnxRegionModel {
    pool: OnnxSessionPool,
    input_size: u32,
    name: String,
}

impl OnnxRegionModel {
    pub fn from_file(
        path: &str,
        input_size: u32,
        forced_backend: Option<&str>,
        pool_size: usize,
    ) -> ModelResult<Self> {
        let model_bytes = std::fs::read(path)
            .map_err(|e| ModelError::Unavailable(format!("cannot read {}: {}", path, e)))?;
        info!("Loading detector model {} ({} bytes)", path, model_bytes.len());

        let (accelerator, first) = build_session_with_acceleration(&model_bytes, "detector", forced_backend)
            .map_err(|e| ModelError::Unavailable(format!("{:#}", e)))?;

        let mut sessions = vec![first];
        for i in 1..pool_size.max(1) {
            debug!("Creating detector session {} of {}", i + 1, pool_size);
            let session = accelerator
                .build(&model_bytes)
                .map_err(|e| ModelError::Unavailable(format!("{:#}", e)))?;
            sessions.push(session);
        }

        info!("✓ Detection: {} ({} sessions)", accelerator.label(), sessions.len());
        Ok(Self {
            pool: OnnxSessionPool::new(sessions),
            input_size,
            name: format!("onnx-{}", accelerator.label()),
        })
    }

    fn preprocess(&self, image: &PixelBuffer) -> Array4<f32> {
        let size = self.input_size;
        let resized = image::imageops::resize(&image.to_rgba_image(), size, size, FilterType::Triangle);

        let s = size as usize;
        let mut array = Array4::<f32>::zeros((1, 3, s, s));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }
        array
    }

    fn infer(session: &mut Session, input: Array4<f32>) -> ModelResult<RawModelOutput> {
        let images = Value::from_array(input)?;
        let outputs = session.run(ort::inputs!["images" => images])?;

        let (_, boxes) = outputs["boxes"].try_extract_tensor::<f32>()?;
        let (_, scores) = outputs["scores"].try_extract_tensor::<f32>()?;
        let classes: Vec<i64> = match outputs["classes"].try_extract_tensor::<i64>() {
            Ok((_, c)) => c.to_vec(),
            Err(_) => {
                let (_, c) = outputs["classes"].try_extract_tensor::<f32>()?;
                c.iter().map(|&v| v.round() as i64).collect()
            }
        };
        let valid_count = match outputs["valid_detections"].try_extract_tensor::<i32>() {
            Ok((_, v)) => v.first().copied().unwrap_or(0).max(0) as usize,
            Err(_) => {
                let (_, v) = outputs["valid_detections"].try_extract_tensor::<i64>()?;
                v.first().copied().unwrap_or(0).max(0) as usize
            }
        };

        Ok(RawModelOutput {
            boxes: boxes.to_vec(),
            scores: scores.to_vec(),
            classes,
            valid_count,
        })
    }
}

impl RegionModel for OnnxRegionModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_detect(&self, image: &PixelBuffer, threshold: f32) -> ModelResult<Vec<Detection>> {
        self.try_detect_with_cancel(image, threshold, &CancelFlag::new())
    }

    fn try_detect_with_cancel(
        &self,
        image: &PixelBuffer,
        threshold: f32,
        cancel: &CancelFlag,
    ) -> ModelResult<Vec<Detection>> {
        let start = Instant::now();
        let input = self.preprocess(image);

        // A caller past its deadline must not hold a session it will not use
        let mut session = self.pool.acquire_unless_cancelled(cancel)?;
        if cancel.is_cancelled() {
            self.pool.release(session);
            return Err(ModelError::Cancelled);
        }
        let raw = Self::infer(&mut session, input);
        self.pool.release(session);
        let raw = raw?;

        trace!("Raw detections from model: {}", raw.valid_count);
        let detections = decode_raw_output(&raw, threshold, image.width(), image.height())?;
        debug!(
            "✓ Inference completed in {:.2}ms: {} detections",
            start.elapsed().as_secs_f64() * 1000.0,
            detections.len()
        );
        Ok(detections)
    }
}
