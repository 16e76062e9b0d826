use crate::core::errors::{DetectError, DetectResult};
use crate::core::types::{luma_of, PixelBuffer};

/// Luma spread at or below which a page counts as a single flat color
const UNIFORM_LUMA_SPREAD: u8 = 2;
/// Alpha below which a pixel counts as transparent
const TRANSPARENT_ALPHA: u8 = 8;
/// Share of transparent pixels that makes a frame near-fully transparent
const TRANSPARENT_SHARE: f64 = 0.99;

/// Asynchronously decode an image into a `PixelBuffer` using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large scans.
pub async fn load_pixel_buffer_async(bytes: &[u8]) -> DetectResult<PixelBuffer> {
    let bytes = bytes.to_vec(); // Clone to move into blocking task
    tokio::task::spawn_blocking(move || PixelBuffer::from_encoded(&bytes))
        .await
        .map_err(|e| DetectError::TaskJoinFailed(format!("image decoding: {}", e)))?
}

/// Why a frame carries no usable content, or `None` when it does.
///
/// Uniform color and near-full transparency are reported; everything else
/// goes through detection.
pub fn content_defect(buffer: &PixelBuffer) -> Option<String> {
    let mut min_luma = u8::MAX;
    let mut max_luma = u8::MIN;
    let mut transparent = 0usize;

    for px in buffer.data().chunks_exact(4) {
        let luma = luma_of(px[0], px[1], px[2]);
        min_luma = min_luma.min(luma);
        max_luma = max_luma.max(luma);
        if px[3] < TRANSPARENT_ALPHA {
            transparent += 1;
        }
    }

    let total = (buffer.width() as usize) * (buffer.height() as usize);
    if transparent as f64 >= TRANSPARENT_SHARE * total as f64 {
        return Some(format!("{} of {} pixels are transparent", transparent, total));
    }
    if max_luma - min_luma <= UNIFORM_LUMA_SPREAD {
        return Some(format!("uniform color (luma {}..={})", min_luma, max_luma));
    }
    None
}
