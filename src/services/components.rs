// Connected-component analysis for heuristic bubble detection
//
// Bubbles are bright regions enclosed by ink. The page is binarized, sampled
// on a stride-2 grid and paper samples are flood-filled into components,
// which are then described by a handful of shape features.

use image::GrayImage;
use std::collections::VecDeque;
use std::f32::consts::PI;
use tracing::{debug, trace};

use crate::core::config::ProcessingOptions;
use crate::core::types::{BoundingBox, Detection, DetectionSource};
use crate::services::classifier;
use crate::services::threshold::{binarize_adaptive, PAPER};

/// Fixed binarization parameters of the analysis pass
pub const ANALYSIS_BLOCK_SIZE: u32 = 15;
pub const ANALYSIS_C: f32 = 10.0;
/// Distance between grid samples, in pixels
pub const GRID_STRIDE: u32 = 2;
/// Components with fewer grid samples are discarded
pub const MIN_COMPONENT_SAMPLES: usize = 100;
/// Tail tips must lie beyond this fraction of the half-diagonal
const TAIL_DISTANCE_FACTOR: f32 = 0.8;

/// Boundary sample of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgePixel {
    pub x: u32,
    pub y: u32,
    /// In-component samples among the 8 grid neighbours
    pub neighbours: u8,
}

/// One 4-connected region of paper samples, in pixel coordinates
#[derive(Debug, Clone)]
pub struct Component {
    pub pixels: Vec<(u32, u32)>,
    pub edge_pixels: Vec<EdgePixel>,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Component {
    /// Build a component from grid coordinates, deriving its boundary.
    ///
    /// A sample is on the boundary when one of its 4 grid neighbours is not
    /// part of the component (including neighbours off the page).
    pub fn from_grid_samples(samples: &[(u32, u32)]) -> Option<Self> {
        let min_gx = samples.iter().map(|s| s.0).min()?;
        let max_gx = samples.iter().map(|s| s.0).max()?;
        let min_gy = samples.iter().map(|s| s.1).min()?;
        let max_gy = samples.iter().map(|s| s.1).max()?;

        let mask_w = (max_gx - min_gx + 1) as i64;
        let mask_h = (max_gy - min_gy + 1) as i64;
        let mut mask = vec![false; (mask_w * mask_h) as usize];
        for &(gx, gy) in samples {
            mask[((gy - min_gy) as i64 * mask_w + (gx - min_gx) as i64) as usize] = true;
        }
        let contains = |lx: i64, ly: i64| -> bool {
            lx >= 0 && ly >= 0 && lx < mask_w && ly < mask_h && mask[(ly * mask_w + lx) as usize]
        };

        let mut edge_pixels = Vec::new();
        for &(gx, gy) in samples {
            let lx = (gx - min_gx) as i64;
            let ly = (gy - min_gy) as i64;
            let boundary = !contains(lx - 1, ly)
                || !contains(lx + 1, ly)
                || !contains(lx, ly - 1)
                || !contains(lx, ly + 1);
            if !boundary {
                continue;
            }
            let mut neighbours = 0u8;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    if (dx, dy) != (0, 0) && contains(lx + dx, ly + dy) {
                        neighbours += 1;
                    }
                }
            }
            edge_pixels.push(EdgePixel {
                x: gx * GRID_STRIDE,
                y: gy * GRID_STRIDE,
                neighbours,
            });
        }

        Some(Self {
            pixels: samples
                .iter()
                .map(|&(gx, gy)| (gx * GRID_STRIDE, gy * GRID_STRIDE))
                .collect(),
            edge_pixels,
            min_x: min_gx * GRID_STRIDE,
            min_y: min_gy * GRID_STRIDE,
            max_x: max_gx * GRID_STRIDE,
            max_y: max_gy * GRID_STRIDE,
        })
    }

    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + GRID_STRIDE
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + GRID_STRIDE
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(
            self.min_x as f32,
            self.min_y as f32,
            self.width() as f32,
            self.height() as f32,
        )
    }

    pub fn centroid(&self) -> (f32, f32) {
        let n = self.pixels.len().max(1) as f32;
        let (sx, sy) = self
            .pixels
            .iter()
            .fold((0f64, 0f64), |(sx, sy), &(x, y)| (sx + x as f64, sy + y as f64));
        (sx as f32 / n, sy as f32 / n)
    }
}

/// Shape descriptors of a component
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeFeatures {
    /// px²
    pub area: f32,
    pub perimeter: f32,
    pub width: f32,
    pub height: f32,
    pub aspect_ratio: f32,
    pub compactness: f32,
    pub fill_ratio: f32,
    pub convexity: f32,
    pub has_tail: bool,
    pub is_valid_size: bool,
}

impl ShapeFeatures {
    pub fn compute(component: &Component, page_width: u32, page_height: u32, tail_neighbor_threshold: u32) -> Self {
        let area = (component.pixels.len() as u32 * GRID_STRIDE * GRID_STRIDE) as f32;
        // Boundary sample count measures city-block length; pi/4 brings it
        // back to Euclidean on average
        let perimeter = component.edge_pixels.len() as f32 * GRID_STRIDE as f32 * PI / 4.0;
        let width = component.width() as f32;
        let height = component.height() as f32;
        let bbox_area = width * height;

        let aspect_ratio = width / height;
        let compactness = if area > 0.0 {
            perimeter * perimeter / (4.0 * PI * area)
        } else {
            f32::INFINITY
        };
        let fill_ratio = area / bbox_area;
        let convexity = area / bbox_area;

        let (cx, cy) = component.centroid();
        let tail_distance = TAIL_DISTANCE_FACTOR * (width * width + height * height).sqrt() / 2.0;
        let has_tail = component.edge_pixels.iter().any(|e| {
            let (dx, dy) = (e.x as f32 - cx, e.y as f32 - cy);
            (e.neighbours as u32) < tail_neighbor_threshold && (dx * dx + dy * dy).sqrt() > tail_distance
        });

        let is_valid_size = width > 30.0
            && height > 20.0
            && width < 0.8 * page_width as f32
            && height < 0.5 * page_height as f32;

        Self {
            area,
            perimeter,
            width,
            height,
            aspect_ratio,
            compactness,
            fill_ratio,
            convexity,
            has_tail,
            is_valid_size,
        }
    }
}

/// Paper/ink samples of a binary page on the analysis grid
struct SampleGrid {
    width: u32,
    height: u32,
    paper: Vec<bool>,
}

impl SampleGrid {
    fn from_binary(binary: &GrayImage) -> Self {
        let width = binary.width().div_ceil(GRID_STRIDE);
        let height = binary.height().div_ceil(GRID_STRIDE);
        let mut paper = Vec::with_capacity((width * height) as usize);
        for gy in 0..height {
            for gx in 0..width {
                paper.push(binary.get_pixel(gx * GRID_STRIDE, gy * GRID_STRIDE).0[0] == PAPER);
            }
        }
        Self { width, height, paper }
    }

    fn index(&self, gx: u32, gy: u32) -> usize {
        (gy * self.width + gx) as usize
    }
}

pub struct ConnectedComponentAnalyzer;

impl ConnectedComponentAnalyzer {
    /// Enclosed bright regions of a binary page, at least
    /// `MIN_COMPONENT_SAMPLES` grid samples large
    pub fn components(binary: &GrayImage) -> Vec<Component> {
        let grid = SampleGrid::from_binary(binary);
        let mut visited = vec![false; grid.paper.len()];
        let mut components = Vec::new();
        let mut queue = VecDeque::new();
        let mut discarded = 0usize;

        for gy in 0..grid.height {
            for gx in 0..grid.width {
                let seed = grid.index(gx, gy);
                if visited[seed] || !grid.paper[seed] {
                    continue;
                }

                let mut samples = Vec::new();
                visited[seed] = true;
                queue.push_back((gx, gy));

                while let Some((x, y)) = queue.pop_front() {
                    samples.push((x, y));
                    let neighbours = [
                        (x.wrapping_sub(1), y),
                        (x + 1, y),
                        (x, y.wrapping_sub(1)),
                        (x, y + 1),
                    ];
                    for (nx, ny) in neighbours {
                        if nx >= grid.width || ny >= grid.height {
                            continue;
                        }
                        let idx = grid.index(nx, ny);
                        if !visited[idx] && grid.paper[idx] {
                            visited[idx] = true;
                            queue.push_back((nx, ny));
                        }
                    }
                }

                if samples.len() < MIN_COMPONENT_SAMPLES {
                    discarded += 1;
                    continue;
                }
                if let Some(component) = Component::from_grid_samples(&samples) {
                    components.push(component);
                }
            }
        }

        trace!(
            "CCA: {} components kept, {} below {} samples",
            components.len(),
            discarded,
            MIN_COMPONENT_SAMPLES
        );
        components
    }

    /// Heuristic bubble candidates of a preprocessed page, in its own frame.
    ///
    /// Every kept component becomes a detection; confidence filtering happens
    /// later, together with the model detections.
    pub fn analyze(gray: &GrayImage, options: &ProcessingOptions) -> Vec<Detection> {
        let binary = binarize_adaptive(gray, ANALYSIS_BLOCK_SIZE, ANALYSIS_C);
        Self::analyze_binary(&binary, options)
    }

    pub fn analyze_binary(binary: &GrayImage, options: &ProcessingOptions) -> Vec<Detection> {
        let (page_w, page_h) = binary.dimensions();
        let detections: Vec<Detection> = Self::components(binary)
            .iter()
            .map(|component| {
                let features = ShapeFeatures::compute(component, page_w, page_h, options.tail_neighbor_threshold);
                let confidence = classifier::score(&features);
                let class = classifier::classify(&features);
                trace!(
                    "Component {:?}: {:?} conf {:.2} ({:?})",
                    component.bbox(),
                    class,
                    confidence,
                    features
                );
                Detection::new(component.bbox(), confidence, class, DetectionSource::Heuristic)
            })
            .collect();

        debug!("Heuristic analysis found {} candidates", detections.len());
        detections
    }
}
