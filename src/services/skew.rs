// Projection-profile skew estimation and correction
//
// Angles are in degrees. A positive angle means the page content is rotated
// clockwise in image coordinates (y pointing down); correcting it rotates by
// the negated angle.

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use tracing::{debug, trace};

/// Pixels darker than this count as ink for the projection
pub const DARK_THRESHOLD: u8 = 128;
/// Candidate angle spacing
pub const ANGLE_STEP: f32 = 0.5;
/// Sampling stride in both axes; also the projection bucket width
const SAMPLE_STRIDE: u32 = 2;

/// Dark sample coordinates relative to the image center
fn dark_samples(img: &GrayImage) -> Vec<(f32, f32)> {
    let cx = img.width() as f32 / 2.0;
    let cy = img.height() as f32 / 2.0;
    let mut samples = Vec::new();

    for y in (0..img.height()).step_by(SAMPLE_STRIDE as usize) {
        for x in (0..img.width()).step_by(SAMPLE_STRIDE as usize) {
            if img.get_pixel(x, y).0[0] < DARK_THRESHOLD {
                samples.push((x as f32 - cx, y as f32 - cy));
            }
        }
    }
    samples
}

/// Variance of bucket counts when dark samples are projected onto the normal
/// of direction `angle_deg`
fn variance_of_projection(samples: &[(f32, f32)], half_diagonal: f32, angle_deg: f32) -> f64 {
    let bucket_count = ((2.0 * half_diagonal) / SAMPLE_STRIDE as f32).ceil() as usize + 2;
    let mut buckets = vec![0u32; bucket_count];
    let (sin_a, cos_a) = angle_deg.to_radians().sin_cos();

    for &(dx, dy) in samples {
        let offset = -dx * sin_a + dy * cos_a + half_diagonal;
        let bucket = (offset / SAMPLE_STRIDE as f32).floor();
        if bucket >= 0.0 && (bucket as usize) < bucket_count {
            buckets[bucket as usize] += 1;
        }
    }

    let n = buckets.len() as f64;
    let mean = buckets.iter().map(|&c| c as f64).sum::<f64>() / n;
    buckets
        .iter()
        .map(|&c| {
            let d = c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n
}

fn half_diagonal(img: &GrayImage) -> f32 {
    let (w, h) = (img.width() as f32, img.height() as f32);
    (w * w + h * h).sqrt() / 2.0
}

/// Projection-profile variance of the page at one candidate angle
pub fn projection_variance(img: &GrayImage, angle_deg: f32) -> f64 {
    let samples = dark_samples(img);
    variance_of_projection(&samples, half_diagonal(img), angle_deg)
}

/// Estimate page skew in `[-max_skew_angle, max_skew_angle]`.
///
/// The angle whose projection has the highest bucket-count variance wins
/// (aligned baselines produce sharp peaks). Ties prefer the smaller
/// magnitude; a page without ink reports 0.
pub fn estimate_skew(img: &GrayImage, max_skew_angle: f32) -> f32 {
    let samples = dark_samples(img);
    if samples.is_empty() {
        trace!("Skew: no dark pixels, assuming 0°");
        return 0.0;
    }

    let diag = half_diagonal(img);
    let steps = (max_skew_angle / ANGLE_STEP).floor() as i32;
    let mut best_angle = 0.0f32;
    let mut best_score = f64::NEG_INFINITY;

    for i in -steps..=steps {
        let angle = i as f32 * ANGLE_STEP;
        let score = variance_of_projection(&samples, diag, angle);
        let better = score > best_score
            || (score == best_score && angle.abs() < best_angle.abs());
        if better {
            best_score = score;
            best_angle = angle;
        }
    }

    debug!(
        "Skew: {:.1}° (variance {:.1}, {} dark samples)",
        best_angle,
        best_score,
        samples.len()
    );
    best_angle
}

/// Nearest-neighbour rotation about the image center, white outside the
/// original extent
pub fn rotate(img: &GrayImage, angle_deg: f32) -> GrayImage {
    rotate_about_center(
        img,
        angle_deg.to_radians(),
        Interpolation::Nearest,
        Luma([255u8]),
    )
}

/// Undo an estimated skew of `angle_deg`
pub fn correct_skew(img: &GrayImage, angle_deg: f32) -> GrayImage {
    rotate(img, -angle_deg)
}

/// Map a point of the deskewed frame back into the skewed frame
pub fn unrotate_point(x: f32, y: f32, width: u32, height: u32, angle_deg: f32) -> (f32, f32) {
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let (s, c) = angle_deg.to_radians().sin_cos();
    let (dx, dy) = (x - cx, y - cy);
    (cx + dx * c - dy * s, cy + dx * s + dy * c)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Horizontal bars of a given thickness drawn at `angle_deg` about the
    /// image center
    fn ruled_page(size: u32, angle_deg: f32) -> GrayImage {
        let mut img = GrayImage::from_pixel(size, size, Luma([255]));
        let c = size as f32 / 2.0;
        let (s, co) = angle_deg.to_radians().sin_cos();
        let half = size as f32 * 0.3;

        let mut line_y = -half;
        while line_y <= half {
            let mut t = -half;
            while t <= half {
                for thickness in 0..3 {
                    let (px, py) = (t, line_y + thickness as f32);
                    let x = c + px * co - py * s;
                    let y = c + px * s + py * co;
                    if x >= 0.0 && y >= 0.0 && (x as u32) < size && (y as u32) < size {
                        img.put_pixel(x as u32, y as u32, Luma([0]));
                    }
                }
                t += 0.5;
            }
            line_y += 16.0;
        }
        img
    }

    #[test]
    fn test_blank_page_has_no_skew() {
        let img = GrayImage::from_pixel(100, 100, Luma([255]));
        assert_eq!(estimate_skew(&img, 15.0), 0.0);
    }

    #[test]
    fn test_straight_page_estimates_zero() {
        let img = ruled_page(300, 0.0);
        assert!(estimate_skew(&img, 15.0).abs() <= 0.5);
    }

    #[test]
    fn test_known_rotation_is_recovered() {
        for theta in [4.0f32, -7.5, 11.0] {
            let img = ruled_page(400, theta);
            let estimated = estimate_skew(&img, 15.0);
            assert!(
                (estimated - theta).abs() <= 1.0,
                "expected ~{}°, got {}°",
                theta,
                estimated
            );
        }
    }

    #[test]
    fn test_correction_sharpens_projection() {
        let theta = 6.0;
        let skewed = ruled_page(400, theta);
        let estimated = estimate_skew(&skewed, 15.0);
        let corrected = correct_skew(&skewed, estimated);

        let before = projection_variance(&skewed, 0.0);
        let after = projection_variance(&corrected, 0.0);
        assert!(after >= before, "variance dropped: {} -> {}", before, after);
        assert!(estimate_skew(&corrected, 15.0).abs() <= 1.0);
    }

    #[test]
    fn test_unrotate_point_inverts_rotation() {
        let (x, y) = unrotate_point(150.0, 50.0, 200, 100, 0.0);
        assert!((x - 150.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);

        // A point right of center moves down when the page is turned clockwise
        let (_, y) = unrotate_point(200.0, 50.0, 200, 100, 10.0);
        assert!(y > 50.0);
    }
}
