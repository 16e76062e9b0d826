// Global and local binarization (Otsu, mean-adaptive, Sauvola)
//
// Output convention: 0 = ink, 255 = paper.

use image::{GrayImage, Luma};
use tracing::trace;

use crate::core::config::BinarizationMethod;

pub const INK: u8 = 0;
pub const PAPER: u8 = 255;

/// Sauvola sensitivity
pub const SAUVOLA_K: f64 = 0.5;
/// Sauvola dynamic range of the standard deviation
pub const SAUVOLA_R: f64 = 128.0;

/// Summed-area tables for O(1) window mean / variance queries
pub struct IntegralImage {
    width: usize,
    height: usize,
    sum: Vec<u64>,
    sum_sq: Vec<u64>,
}

impl IntegralImage {
    pub fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sum_sq = vec![0u64; stride * (h + 1)];
        let raw = img.as_raw();

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let v = raw[y * w + x] as u64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }

        Self {
            width: w,
            height: h,
            sum,
            sum_sq,
        }
    }

    /// Mean and population variance over the window of `radius` around
    /// (x, y), clipped to the image
    pub fn window_stats(&self, x: u32, y: u32, radius: u32) -> (f64, f64) {
        let x0 = (x as usize).saturating_sub(radius as usize);
        let y0 = (y as usize).saturating_sub(radius as usize);
        let x1 = (x as usize + radius as usize + 1).min(self.width);
        let y1 = (y as usize + radius as usize + 1).min(self.height);
        let stride = self.width + 1;

        let area = |table: &[u64]| -> u64 {
            table[y1 * stride + x1] + table[y0 * stride + x0]
                - table[y0 * stride + x1]
                - table[y1 * stride + x0]
        };

        let count = ((x1 - x0) * (y1 - y0)) as f64;
        let mean = area(&self.sum) as f64 / count;
        let variance = (area(&self.sum_sq) as f64 / count - mean * mean).max(0.0);
        (mean, variance)
    }
}

/// Otsu's global threshold.
///
/// Pixels `< t` are ink. When a whole range of thresholds maximizes the
/// inter-class variance (e.g. a two-level image) the midpoint of that range
/// is returned.
pub fn otsu_threshold(img: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for p in img.pixels() {
        histogram[p.0[0] as usize] += 1;
    }

    let total = img.pixels().len() as f64;
    if total == 0.0 {
        return 128;
    }
    let total_sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(v, &n)| v as f64 * n as f64)
        .sum();

    let mut variances = [0f64; 257];
    let mut count_b = 0f64;
    let mut sum_b = 0f64;
    for t in 0..=256usize {
        if t > 0 {
            count_b += histogram[t - 1] as f64;
            sum_b += (t - 1) as f64 * histogram[t - 1] as f64;
        }
        let count_f = total - count_b;
        if count_b == 0.0 || count_f == 0.0 {
            continue;
        }
        let w_b = count_b / total;
        let w_f = count_f / total;
        let m_b = sum_b / count_b;
        let m_f = (total_sum - sum_b) / count_f;
        variances[t] = w_b * w_f * (m_b - m_f) * (m_b - m_f);
    }

    let best = variances.iter().cloned().fold(0.0f64, f64::max);
    let tolerance = best * 1e-9;
    let first = variances
        .iter()
        .position(|&v| v >= best - tolerance)
        .unwrap_or(128);
    let last = variances
        .iter()
        .rposition(|&v| v >= best - tolerance)
        .unwrap_or(128);

    let threshold = ((first + last) / 2).min(255) as u8;
    trace!("Otsu: best variance {:.2}, range [{}, {}] -> {}", best, first, last, threshold);
    threshold
}

pub fn binarize_with_threshold(img: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        if img.get_pixel(x, y).0[0] < threshold {
            Luma([INK])
        } else {
            Luma([PAPER])
        }
    })
}

pub fn binarize_otsu(img: &GrayImage) -> GrayImage {
    binarize_with_threshold(img, otsu_threshold(img))
}

/// Ink where a pixel is darker than its local mean minus `c`
pub fn binarize_adaptive(img: &GrayImage, block_size: u32, c: f32) -> GrayImage {
    let integral = IntegralImage::new(img);
    let radius = block_size / 2;
    let c = c as f64;

    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let (mean, _) = integral.window_stats(x, y, radius);
        if (img.get_pixel(x, y).0[0] as f64) < mean - c {
            Luma([INK])
        } else {
            Luma([PAPER])
        }
    })
}

/// Sauvola: `t = mean * (1 + k * (std / R - 1))`
pub fn binarize_sauvola(img: &GrayImage, block_size: u32) -> GrayImage {
    let integral = IntegralImage::new(img);
    let radius = block_size / 2;

    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let (mean, variance) = integral.window_stats(x, y, radius);
        let threshold = mean * (1.0 + SAUVOLA_K * (variance.sqrt() / SAUVOLA_R - 1.0));
        if (img.get_pixel(x, y).0[0] as f64) < threshold {
            Luma([INK])
        } else {
            Luma([PAPER])
        }
    })
}

pub fn binarize(img: &GrayImage, method: BinarizationMethod, block_size: u32, c: f32) -> GrayImage {
    match method {
        BinarizationMethod::Otsu => binarize_otsu(img),
        BinarizationMethod::Adaptive => binarize_adaptive(img, block_size, c),
        BinarizationMethod::Sauvola => binarize_sauvola(img, block_size),
    }
}
