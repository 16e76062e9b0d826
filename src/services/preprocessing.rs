// Page preprocessing: resize, grayscale, denoise, contrast, deskew,
// binarize and screentone suppression.
//
// Every stage takes its input by reference and returns a new image, so the
// caller's buffer is never touched.

use image::imageops::FilterType;
use image::{GrayImage, Luma};
use imageproc::contrast::equalize_histogram;
use imageproc::filter::median_filter;
use std::time::Instant;
use tracing::debug;

use crate::core::config::ProcessingOptions;
use crate::core::errors::DetectResult;
use crate::core::types::{luma_of, CancelFlag, PixelBuffer, StageTiming};
use crate::services::skew;
use crate::services::threshold::{self, IntegralImage};

/// Screentone window radius (5x5)
const SCREEN_TONE_RADIUS: u32 = 2;
/// CLAHE tiles smaller than this fall back to global equalization
const MIN_TILE_SIDE: u32 = 2;

/// Scale the page so its longer side lands in `[min_dimension, max_dimension]`.
///
/// Returns the resized buffer and the applied scale factor (new / old).
pub fn resize_to_optimal(
    buffer: &PixelBuffer,
    max_dimension: u32,
    min_dimension: u32,
) -> DetectResult<(PixelBuffer, f32)> {
    let (w, h) = (buffer.width(), buffer.height());
    let longest = w.max(h);

    let scale = if longest > max_dimension {
        max_dimension as f32 / longest as f32
    } else if longest < min_dimension {
        min_dimension as f32 / longest as f32
    } else {
        return Ok((buffer.clone(), 1.0));
    };

    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    let resized = image::imageops::resize(&buffer.to_rgba_image(), new_w, new_h, FilterType::Triangle);

    debug!("Resized {}x{} -> {}x{} (scale {:.3})", w, h, new_w, new_h, scale);
    Ok((PixelBuffer::from_rgba_image(resized)?, scale))
}

/// BT.601 luma replicated into R, G and B; alpha preserved
pub fn to_grayscale(buffer: &PixelBuffer) -> DetectResult<PixelBuffer> {
    let mut data = Vec::with_capacity(buffer.data().len());
    for px in buffer.data().chunks_exact(4) {
        let l = luma_of(px[0], px[1], px[2]);
        data.extend_from_slice(&[l, l, l, px[3]]);
    }
    PixelBuffer::new(buffer.width(), buffer.height(), data)
}

pub fn luma_plane(buffer: &PixelBuffer) -> GrayImage {
    buffer.to_gray_image()
}

/// 3x3 median filter. Any non-zero strength applies the same filter;
/// 0 is a pass-through.
pub fn denoise(img: &GrayImage, strength: u32) -> GrayImage {
    if strength == 0 {
        return img.clone();
    }
    median_filter(img, 1, 1)
}

/// Contrast-limited adaptive histogram equalization over a
/// `tile_size x tile_size` grid of tiles
pub fn enhance_contrast(img: &GrayImage, clip_limit: f32, tile_size: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let grid = tile_size.max(1);
    let tile_w = w.div_ceil(grid);
    let tile_h = h.div_ceil(grid);

    if tile_w < MIN_TILE_SIDE || tile_h < MIN_TILE_SIDE {
        debug!("CLAHE tiles too small ({}x{}), using global equalization", tile_w, tile_h);
        return equalize_histogram(img);
    }

    let tiles_x = w.div_ceil(tile_w);
    let tiles_y = h.div_ceil(tile_h);
    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            luts.push(tile_mapping(
                img,
                (x0, y0),
                ((x0 + tile_w).min(w), (y0 + tile_h).min(h)),
                clip_limit,
            ));
        }
    }

    let lut = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];

    GrayImage::from_fn(w, h, |x, y| {
        let v = img.get_pixel(x, y).0[0] as usize;
        let (tx0, tx1, ax) = neighbouring_tiles((x as f32 + 0.5) / tile_w as f32 - 0.5, tiles_x);
        let (ty0, ty1, ay) = neighbouring_tiles((y as f32 + 0.5) / tile_h as f32 - 0.5, tiles_y);

        let top = lut(tx0, ty0)[v] * (1.0 - ax) + lut(tx1, ty0)[v] * ax;
        let bottom = lut(tx0, ty1)[v] * (1.0 - ax) + lut(tx1, ty1)[v] * ax;
        let value = top * (1.0 - ay) + bottom * ay;
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

/// Tile indices on either side of a fractional tile coordinate and the
/// interpolation weight of the second one
fn neighbouring_tiles(f: f32, count: u32) -> (u32, u32, f32) {
    if f <= 0.0 {
        return (0, 0, 0.0);
    }
    let i0 = f.floor() as u32;
    if i0 + 1 >= count {
        return (count - 1, count - 1, 0.0);
    }
    (i0, i0 + 1, f - i0 as f32)
}

/// Clipped cumulative histogram of one tile, scaled to 0..=255
fn tile_mapping(img: &GrayImage, (x0, y0): (u32, u32), (x1, y1): (u32, u32), clip_limit: f32) -> [f32; 256] {
    let mut histogram = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            histogram[img.get_pixel(x, y).0[0] as usize] += 1;
        }
    }
    let count = (x1 - x0) * (y1 - y0);

    let limit = (clip_limit * count as f32 / 256.0).max(1.0) as u32;
    let mut excess = 0u32;
    for bin in histogram.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let per_bin = excess / 256;
    let remainder = excess % 256;
    for (i, bin) in histogram.iter_mut().enumerate() {
        *bin += per_bin;
        if (i as u32) < remainder {
            *bin += 1;
        }
    }

    let scale = 255.0 / count as f32;
    let mut mapping = [0f32; 256];
    let mut cdf = 0u32;
    for (i, bin) in histogram.iter().enumerate() {
        cdf += bin;
        mapping[i] = cdf as f32 * scale;
    }
    mapping
}

/// Estimate skew and rotate it away when it reaches `threshold`.
///
/// Returns the corrected image and the angle that was actually removed
/// (0 when no rotation happened).
pub fn deskew(img: &GrayImage, max_skew_angle: f32, threshold: f32) -> (GrayImage, f32) {
    let angle = skew::estimate_skew(img, max_skew_angle);
    if angle == 0.0 || angle.abs() < threshold {
        return (img.clone(), 0.0);
    }
    (skew::correct_skew(img, angle), angle)
}

/// Flatten halftone dot patterns: pixels whose 5x5 variance falls inside
/// `[variance_min, variance_max]` take the local mean
pub fn remove_screen_tones(img: &GrayImage, variance_min: f32, variance_max: f32) -> GrayImage {
    let integral = IntegralImage::new(img);
    let (lo, hi) = (variance_min as f64, variance_max as f64);

    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let (mean, variance) = integral.window_stats(x, y, SCREEN_TONE_RADIUS);
        if variance >= lo && variance <= hi {
            Luma([mean.round().clamp(0.0, 255.0) as u8])
        } else {
            *img.get_pixel(x, y)
        }
    })
}

/// Output of the preprocessing pipeline, in the resized (working) frame
#[derive(Debug, Clone)]
pub struct PreprocessedPage {
    pub gray: GrayImage,
    /// Working size / source size
    pub scale: f32,
    /// Skew removed by the deskew stage, degrees
    pub skew_angle: f32,
    pub stages: Vec<StageTiming>,
}

impl PreprocessedPage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.gray.dimensions()
    }
}

pub struct PreprocessingPipeline;

impl PreprocessingPipeline {
    /// Run every enabled stage in order, checking `cancel` between stages
    pub fn run(
        buffer: &PixelBuffer,
        options: &ProcessingOptions,
        cancel: &CancelFlag,
    ) -> DetectResult<PreprocessedPage> {
        let mut stages = Vec::new();

        cancel.check()?;
        let start = Instant::now();
        let (resized, scale) = resize_to_optimal(buffer, options.max_dimension, options.min_dimension)?;
        record(&mut stages, "resize", start);

        cancel.check()?;
        let start = Instant::now();
        let mut gray = luma_plane(&to_grayscale(&resized)?);
        drop(resized);
        record(&mut stages, "grayscale", start);

        if options.enable_denoising {
            cancel.check()?;
            let start = Instant::now();
            gray = denoise(&gray, options.denoise_strength);
            record(&mut stages, "denoise", start);
        }

        if options.enable_contrast_enhancement {
            cancel.check()?;
            let start = Instant::now();
            gray = enhance_contrast(&gray, options.contrast_clip_limit, options.contrast_tile_size);
            record(&mut stages, "contrast", start);
        }

        let mut skew_angle = 0.0;
        if options.enable_deskewing {
            cancel.check()?;
            let start = Instant::now();
            let (corrected, angle) = deskew(&gray, options.max_skew_angle, options.skew_correction_threshold);
            gray = corrected;
            skew_angle = angle;
            record(&mut stages, "deskew", start);
        }

        if options.enable_binarization {
            cancel.check()?;
            let start = Instant::now();
            gray = threshold::binarize(
                &gray,
                options.binarization_method,
                options.adaptive_block_size,
                options.adaptive_c,
            );
            record(&mut stages, "binarize", start);
        }

        if options.screen_tone_removal {
            cancel.check()?;
            let start = Instant::now();
            gray = remove_screen_tones(
                &gray,
                options.screen_tone_variance_min,
                options.screen_tone_variance_max,
            );
            record(&mut stages, "screen_tones", start);
        }

        Ok(PreprocessedPage {
            gray,
            scale,
            skew_angle,
            stages,
        })
    }
}

fn record(stages: &mut Vec<StageTiming>, stage: &'static str, start: Instant) {
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    debug!("Preprocessing stage {} took {:.2}ms", stage, elapsed_ms);
    stages.push(StageTiming { stage, elapsed_ms });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::DetectError;

    #[test]
    fn test_resize_is_noop_inside_range() {
        let buf = PixelBuffer::filled(1000, 800, [200, 10, 10, 255]).unwrap();
        let (out, scale) = resize_to_optimal(&buf, 2048, 400).unwrap();
        assert_eq!(scale, 1.0);
        assert_eq!(out, buf);
    }

    #[test]
    fn test_resize_scales_into_range() {
        let big = PixelBuffer::filled(4000, 2000, [255, 255, 255, 255]).unwrap();
        let (out, scale) = resize_to_optimal(&big, 2048, 400).unwrap();
        assert_eq!((out.width(), out.height()), (2048, 1024));
        assert!((scale - 0.512).abs() < 1e-6);

        let small = PixelBuffer::filled(200, 100, [255, 255, 255, 255]).unwrap();
        let (out, scale) = resize_to_optimal(&small, 2048, 400).unwrap();
        assert_eq!((out.width(), out.height()), (400, 200));
        assert_eq!(scale, 2.0);
    }

    #[test]
    fn test_grayscale_uses_bt601_and_keeps_alpha() {
        let buf = PixelBuffer::new(2, 1, vec![255, 0, 0, 128, 0, 0, 255, 255]).unwrap();
        let gray = to_grayscale(&buf).unwrap();
        assert_eq!(gray.pixel(0, 0), [76, 76, 76, 128]);
        assert_eq!(gray.pixel(1, 0), [29, 29, 29, 255]);
        assert_eq!(luma_plane(&gray).get_pixel(0, 0).0[0], 76);
    }

    #[test]
    fn test_denoise_removes_salt_noise() {
        let mut img = GrayImage::from_pixel(20, 20, Luma([200]));
        img.put_pixel(10, 10, Luma([0]));
        let out = denoise(&img, 10);
        assert_eq!(out.get_pixel(10, 10).0[0], 200);
        assert_eq!(denoise(&img, 0), img);
    }

    #[test]
    fn test_contrast_stretches_low_contrast_page() {
        let img = GrayImage::from_fn(128, 128, |x, y| Luma([100 + ((x + y) % 31) as u8]));
        let out = enhance_contrast(&img, 2.0, 8);
        let (lo, hi) = out
            .pixels()
            .fold((255u8, 0u8), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
        assert!(hi - lo > 30, "range only {}..{}", lo, hi);

        // Paper stays paper
        let white = GrayImage::from_pixel(64, 64, Luma([255]));
        assert!(enhance_contrast(&white, 2.0, 8).pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn test_contrast_falls_back_on_tiny_tiles() {
        let img = GrayImage::from_fn(8, 8, |x, _| Luma([(x * 10) as u8]));
        assert_eq!(enhance_contrast(&img, 2.0, 8), equalize_histogram(&img));
    }

    #[test]
    fn test_screen_tones_are_flattened() {
        let mut img = GrayImage::from_pixel(40, 40, Luma([255]));
        for y in 0..20 {
            for x in 0..40 {
                let v = if (x + y) % 2 == 0 { 190 } else { 230 };
                img.put_pixel(x, y, Luma([v]));
            }
        }
        let out = remove_screen_tones(&img, 100.0, 2000.0);
        for x in 2..38 {
            let v = out.get_pixel(x, 8).0[0];
            assert!((200..=220).contains(&v), "tone pixel {} at x={}", v, x);
        }
        assert_eq!(out.get_pixel(20, 35).0[0], 255);

        // Hard ink edges lie above the band
        let bin = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 0 } else { 255 }]));
        assert_eq!(remove_screen_tones(&bin, 100.0, 2000.0), bin);
    }

    #[test]
    fn test_pipeline_reports_scale_and_stages() {
        let buf = PixelBuffer::filled(3000, 1500, [255, 255, 255, 255]).unwrap();
        let page = PreprocessingPipeline::run(&buf, &ProcessingOptions::default(), &CancelFlag::new()).unwrap();
        assert_eq!(page.dimensions(), (2048, 1024));
        assert!((page.scale - 2048.0 / 3000.0).abs() < 1e-6);
        assert_eq!(page.skew_angle, 0.0);
        let names: Vec<_> = page.stages.iter().map(|s| s.stage).collect();
        assert_eq!(
            names,
            ["resize", "grayscale", "denoise", "contrast", "deskew", "binarize", "screen_tones"]
        );
    }

    #[test]
    fn test_pipeline_skips_disabled_stages() {
        let buf = PixelBuffer::filled(500, 500, [120, 120, 120, 255]).unwrap();
        let options = ProcessingOptions {
            enable_denoising: false,
            enable_binarization: false,
            enable_deskewing: false,
            enable_contrast_enhancement: false,
            screen_tone_removal: false,
            ..ProcessingOptions::default()
        };
        let page = PreprocessingPipeline::run(&buf, &options, &CancelFlag::new()).unwrap();
        assert_eq!(page.stages.len(), 2);
        assert!(page.gray.pixels().all(|p| p.0[0] == 120));
    }

    #[test]
    fn test_pipeline_honours_cancellation() {
        let buf = PixelBuffer::filled(500, 500, [255, 255, 255, 255]).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = PreprocessingPipeline::run(&buf, &ProcessingOptions::default(), &cancel).unwrap_err();
        assert_eq!(err, DetectError::Cancelled);
    }
}
