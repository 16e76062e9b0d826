// Core data types shared by every stage of the detection pipeline

use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::errors::{DetectError, DetectResult};

/// Canonical RGBA page buffer, row-major, 4 bytes per pixel.
///
/// Construction validates the dimensions against the byte length, so every
/// stage downstream can assume a well-formed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw RGBA bytes, rejecting malformed buffers immediately
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> DetectResult<Self> {
        if width == 0 || height == 0 {
            return Err(DetectError::invalid_input(format!(
                "dimensions must be > 0, got {}x{}",
                width, height
            )));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| {
                DetectError::invalid_input(format!("dimensions {}x{} overflow the buffer size", width, height))
            })?;
        if data.len() != expected {
            return Err(DetectError::invalid_input(format!(
                "expected {} bytes for {}x{} RGBA, got {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Solid-color buffer (mostly for tests and warmup)
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> DetectResult<Self> {
        let len = width as usize * height as usize;
        let data = rgba.iter().copied().cycle().take(len * 4).collect();
        Self::new(width, height, data)
    }

    pub fn from_rgba_image(img: RgbaImage) -> DetectResult<Self> {
        let (width, height) = img.dimensions();
        Self::new(width, height, img.into_raw())
    }

    pub fn from_dynamic_image(img: &DynamicImage) -> DetectResult<Self> {
        Self::from_rgba_image(img.to_rgba8())
    }

    /// Expand a single-channel image into an opaque RGBA buffer
    pub fn from_gray(img: &GrayImage) -> DetectResult<Self> {
        let (width, height) = img.dimensions();
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for p in img.pixels() {
            let l = p.0[0];
            data.extend_from_slice(&[l, l, l, 255]);
        }
        Self::new(width, height, data)
    }

    /// Packed RGB bytes (3 per pixel) to opaque RGBA
    pub fn from_rgb_bytes(width: u32, height: u32, rgb: &[u8]) -> DetectResult<Self> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            return Err(DetectError::invalid_input(format!(
                "expected {} bytes for {}x{} RGB, got {}",
                expected,
                width,
                height,
                rgb.len()
            )));
        }
        let mut data = Vec::with_capacity(expected / 3 * 4);
        for px in rgb.chunks_exact(3) {
            data.extend_from_slice(&[px[0], px[1], px[2], 255]);
        }
        Self::new(width, height, data)
    }

    /// Decode an encoded image (PNG, JPEG, WebP)
    pub fn from_encoded(bytes: &[u8]) -> DetectResult<Self> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| DetectError::invalid_input(format!("failed to decode image: {}", e)))?;
        Self::from_dynamic_image(&img)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }

    /// ITU-R BT.601 luma of one pixel
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        let [r, g, b, _] = self.pixel(x, y);
        luma_of(r, g, b)
    }

    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| Luma([self.luma(x, y)]))
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| Rgba(self.pixel(x, y)))
    }
}

pub(crate) fn luma_of(r: u8, g: u8, b: u8) -> u8 {
    let l = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    l.round().clamp(0.0, 255.0) as u8
}

/// Region classes in output priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionClass {
    SpeechBubble,
    ThoughtBubble,
    NarrationBox,
    SfxBubble,
    Panel,
    TextLine,
}

impl RegionClass {
    pub fn priority(self) -> u8 {
        match self {
            RegionClass::SpeechBubble => 0,
            RegionClass::ThoughtBubble => 1,
            RegionClass::NarrationBox => 2,
            RegionClass::SfxBubble => 3,
            RegionClass::Panel => 4,
            RegionClass::TextLine => 5,
        }
    }

    /// Class id emitted by the detection model
    pub fn from_model_label(label: i64) -> Option<Self> {
        match label {
            0 => Some(RegionClass::SpeechBubble),
            1 => Some(RegionClass::ThoughtBubble),
            2 => Some(RegionClass::NarrationBox),
            3 => Some(RegionClass::SfxBubble),
            4 => Some(RegionClass::Panel),
            5 => Some(RegionClass::TextLine),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegionClass::SpeechBubble => "speech_bubble",
            RegionClass::ThoughtBubble => "thought_bubble",
            RegionClass::NarrationBox => "narration_box",
            RegionClass::SfxBubble => "sfx_bubble",
            RegionClass::Panel => "panel",
            RegionClass::TextLine => "text_line",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Ml,
    Heuristic,
}

/// Axis-aligned box in pixel space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1.min(x2), y1.min(y2), (x2 - x1).abs(), (y2 - y1).abs())
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        (x2 - x1) * (y2 - y1)
    }

    /// Intersection over union; 0 for disjoint or degenerate boxes
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let intersection = self.intersection_area(other);
        if intersection <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            (intersection / union).min(1.0)
        } else {
            0.0
        }
    }

    /// Clamp to `[0, width) x [0, height)`
    pub fn clamped(&self, width: f32, height: f32) -> BoundingBox {
        let x1 = self.x.clamp(0.0, width);
        let y1 = self.y.clamp(0.0, height);
        let x2 = self.right().clamp(0.0, width);
        let y2 = self.bottom().clamp(0.0, height);
        BoundingBox::from_corners(x1, y1, x2, y2)
    }
}

/// One detected region. Immutable once it leaves the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub center_x: f32,
    pub center_y: f32,
    pub confidence: f32,
    pub class: RegionClass,
    pub source: DetectionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panel_id: Option<u32>,
}

impl Detection {
    pub fn new(
        bbox: BoundingBox,
        confidence: f32,
        class: RegionClass,
        source: DetectionSource,
    ) -> Self {
        let (center_x, center_y) = bbox.center();
        Self {
            id: 0,
            x: bbox.x,
            y: bbox.y,
            width: bbox.width,
            height: bbox.height,
            center_x,
            center_y,
            confidence: confidence.clamp(0.0, 1.0),
            class,
            source,
            panel_id: None,
        }
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.x, self.y, self.width, self.height)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        self.bbox().iou(&other.bbox())
    }

    pub(crate) fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.x = bbox.x;
        self.y = bbox.y;
        self.width = bbox.width;
        self.height = bbox.height;
        let (cx, cy) = bbox.center();
        self.center_x = cx;
        self.center_y = cy;
        self
    }
}

/// Expected, non-fatal conditions worth telling the caller about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    ModelUnavailable { reason: String },
    MlTimedOut { timeout_ms: u64 },
    CorruptedFrame { reason: String },
}

/// Panel grouping and reading order, expressed as detection ids
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelLayout {
    pub rows: Vec<Vec<u32>>,
    pub columns: Vec<Vec<u32>>,
    pub reading_order: Vec<u32>,
}

/// Final artifact handed to collaborators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    pub detections: Vec<Detection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<PanelLayout>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub advisories: Vec<Advisory>,
}

impl DetectionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter()
    }

    pub fn of_class(&self, class: RegionClass) -> impl Iterator<Item = &Detection> {
        self.detections.iter().filter(move |d| d.class == class)
    }
}

/// Elapsed time of one named stage
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: &'static str,
    pub elapsed_ms: f64,
}

/// Cooperative cancellation shared between an invocation and its blocking work
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Checked between stages
    pub fn check(&self) -> DetectResult<()> {
        if self.is_cancelled() {
            Err(DetectError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_buffer_rejects_length_mismatch() {
        let err = PixelBuffer::new(4, 4, vec![0; 63]).unwrap_err();
        assert!(matches!(err, DetectError::InvalidInput { .. }));

        assert!(PixelBuffer::new(0, 4, vec![]).is_err());
        assert!(PixelBuffer::new(4, 4, vec![0; 64]).is_ok());
    }

    #[test]
    fn test_tall_strip_is_accepted_and_overflow_rejected() {
        let strip = PixelBuffer::filled(64, 20_000, [255, 255, 255, 255]).unwrap();
        assert_eq!((strip.width(), strip.height()), (64, 20_000));

        let err = PixelBuffer::new(u32::MAX, u32::MAX, Vec::new()).unwrap_err();
        assert!(matches!(err, DetectError::InvalidInput { .. }));
    }

    #[test]
    fn test_rgb_and_gray_normalization() {
        let rgb = [255u8, 0, 0, 0, 255, 0];
        let buf = PixelBuffer::from_rgb_bytes(2, 1, &rgb).unwrap();
        assert_eq!(buf.pixel(0, 0), [255, 0, 0, 255]);
        assert_eq!(buf.luma(0, 0), 76);
        assert_eq!(buf.luma(1, 0), 150);

        let gray = GrayImage::from_pixel(3, 2, Luma([42]));
        let buf = PixelBuffer::from_gray(&gray).unwrap();
        assert_eq!(buf.pixel(2, 1), [42, 42, 42, 255]);
        assert_eq!(buf.to_gray_image(), gray);
    }

    #[test]
    fn test_encoded_roundtrip_through_png() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(5, 3, Rgba([10, 20, 30, 255])));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let buf = PixelBuffer::from_encoded(&bytes).unwrap();
        assert_eq!((buf.width(), buf.height()), (5, 3));
        assert_eq!(buf.pixel(4, 2), [10, 20, 30, 255]);

        assert!(PixelBuffer::from_encoded(b"not an image").is_err());
    }

    #[test]
    fn test_iou_properties() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        let c = BoundingBox::new(20.0, 20.0, 5.0, 5.0);

        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - b.iou(&a)).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&c), 0.0);

        // Touching edges do not overlap
        let d = BoundingBox::new(10.0, 0.0, 10.0, 10.0);
        assert_eq!(a.iou(&d), 0.0);
    }

    #[test]
    fn test_region_class_priority_order() {
        let mut classes = vec![
            RegionClass::Panel,
            RegionClass::SfxBubble,
            RegionClass::SpeechBubble,
            RegionClass::NarrationBox,
            RegionClass::ThoughtBubble,
        ];
        classes.sort_by_key(|c| c.priority());
        assert_eq!(
            classes,
            vec![
                RegionClass::SpeechBubble,
                RegionClass::ThoughtBubble,
                RegionClass::NarrationBox,
                RegionClass::SfxBubble,
                RegionClass::Panel,
            ]
        );
        assert_eq!(RegionClass::from_model_label(4), Some(RegionClass::Panel));
        assert_eq!(RegionClass::from_model_label(9), None);
    }

    #[test]
    fn test_detection_serializes_snake_case() {
        let det = Detection::new(
            BoundingBox::new(1.0, 2.0, 3.0, 4.0),
            1.4,
            RegionClass::NarrationBox,
            DetectionSource::Heuristic,
        );
        assert_eq!(det.confidence, 1.0);
        let json = serde_json::to_value(&det).unwrap();
        assert_eq!(json["class"], "narration_box");
        assert_eq!(json["source"], "heuristic");
        assert!(json.get("panel_id").is_none());
    }
}
