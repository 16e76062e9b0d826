// Panel border detection from long straight ink runs

use image::GrayImage;
use tracing::{debug, trace};

use crate::core::types::{BoundingBox, Detection, DetectionSource, RegionClass};
use crate::services::threshold::INK;

/// Shortest ink run that can be part of a panel border
pub const MIN_RUN_LENGTH: u32 = 50;
/// Enclosed regions must exceed this in both directions
pub const MIN_PANEL_SIDE: f32 = 100.0;
pub const PANEL_CONFIDENCE: f32 = 0.8;
/// Slack when matching line ends against each other
const SPAN_TOLERANCE: u32 = 5;

/// A straight border stroke. `start..=end` runs along the line,
/// `across_start..=across_end` is its thickness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSegment {
    pub start: u32,
    pub end: u32,
    pub across_start: u32,
    pub across_end: u32,
}

impl LineSegment {
    pub fn position(&self) -> f32 {
        (self.across_start + self.across_end) as f32 / 2.0
    }

    fn spans(&self, from: u32, to: u32) -> bool {
        self.start <= from + SPAN_TOLERANCE && self.end + SPAN_TOLERANCE >= to
    }
}

/// Maximal ink runs of at least `MIN_RUN_LENGTH` along one line of pixels
fn ink_runs(line: impl Iterator<Item = bool>) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut current: Option<u32> = None;
    let mut last = 0u32;

    for (i, ink) in line.enumerate() {
        let i = i as u32;
        last = i;
        match (ink, current) {
            (true, None) => current = Some(i),
            (false, Some(start)) => {
                if i - start >= MIN_RUN_LENGTH {
                    runs.push((start, i - 1));
                }
                current = None;
            }
            _ => {}
        }
    }
    if let Some(start) = current {
        if last + 1 - start >= MIN_RUN_LENGTH {
            runs.push((start, last));
        }
    }
    runs
}

/// Join overlapping runs of consecutive lines into segments
fn merge_runs(runs_per_line: Vec<Vec<(u32, u32)>>) -> Vec<LineSegment> {
    let mut finished = Vec::new();
    let mut open: Vec<LineSegment> = Vec::new();

    for (pos, runs) in runs_per_line.into_iter().enumerate() {
        let pos = pos as u32;
        let mut still_open = Vec::with_capacity(runs.len());
        for (s, e) in runs {
            match open.iter().position(|seg| seg.start <= e && s <= seg.end) {
                Some(i) => {
                    let mut seg = open.swap_remove(i);
                    seg.start = seg.start.min(s);
                    seg.end = seg.end.max(e);
                    seg.across_end = pos;
                    still_open.push(seg);
                }
                None => still_open.push(LineSegment {
                    start: s,
                    end: e,
                    across_start: pos,
                    across_end: pos,
                }),
            }
        }
        finished.append(&mut open);
        open = still_open;
    }
    finished.extend(open);
    finished
}

pub struct PanelBorderScanner;

impl PanelBorderScanner {
    pub fn horizontal_lines(binary: &GrayImage) -> Vec<LineSegment> {
        let (w, h) = binary.dimensions();
        let rows = (0..h)
            .map(|y| ink_runs((0..w).map(|x| binary.get_pixel(x, y).0[0] == INK)))
            .collect();
        merge_runs(rows)
    }

    pub fn vertical_lines(binary: &GrayImage) -> Vec<LineSegment> {
        let (w, h) = binary.dimensions();
        let columns = (0..w)
            .map(|x| ink_runs((0..h).map(|y| binary.get_pixel(x, y).0[0] == INK)))
            .collect();
        merge_runs(columns)
    }

    /// Rectangles framed by two horizontal and two vertical border lines.
    ///
    /// For every top line the nearest bottom line that yields a panel wins;
    /// vertical lines between them split the band into side-by-side panels.
    pub fn scan(binary: &GrayImage) -> Vec<Detection> {
        let mut horizontal = Self::horizontal_lines(binary);
        let vertical = Self::vertical_lines(binary);
        horizontal.sort_by(|a, b| a.position().total_cmp(&b.position()));
        trace!(
            "Panel scan: {} horizontal, {} vertical lines",
            horizontal.len(),
            vertical.len()
        );

        let mut panels: Vec<BoundingBox> = Vec::new();
        for top in &horizontal {
            for bottom in horizontal
                .iter()
                .filter(|b| b.position() - top.position() > MIN_PANEL_SIDE)
            {
                let left_bound = top.start.max(bottom.start).saturating_sub(SPAN_TOLERANCE);
                let right_bound = top.end.min(bottom.end) + SPAN_TOLERANCE;
                if left_bound > right_bound {
                    continue;
                }

                let mut sides: Vec<&LineSegment> = vertical
                    .iter()
                    .filter(|v| v.spans(top.across_start, bottom.across_end))
                    .filter(|v| v.across_start + SPAN_TOLERANCE >= left_bound && v.across_end <= right_bound)
                    .collect();
                sides.sort_by(|a, b| a.position().total_cmp(&b.position()));

                let mut found = false;
                for pair in sides.windows(2) {
                    let (left, right) = (pair[0], pair[1]);
                    if right.position() - left.position() <= MIN_PANEL_SIDE {
                        continue;
                    }
                    let bbox = BoundingBox::from_corners(
                        left.across_start as f32,
                        top.across_start as f32,
                        (right.across_end + 1) as f32,
                        (bottom.across_end + 1) as f32,
                    );
                    if !panels.iter().any(|p| p.iou(&bbox) > 0.9) {
                        panels.push(bbox);
                    }
                    found = true;
                }
                if found {
                    break;
                }
            }
        }

        debug!("Panel scan found {} panels", panels.len());
        panels
            .into_iter()
            .map(|bbox| Detection::new(bbox, PANEL_CONFIDENCE, RegionClass::Panel, DetectionSource::Heuristic))
            .collect()
    }
}
