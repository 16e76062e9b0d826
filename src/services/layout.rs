// Panel rows/columns, reading order and bubble-to-panel association

use tracing::debug;

use crate::core::config::ReadingDirection;
use crate::core::types::{Detection, PanelLayout, RegionClass};

/// Share of the anchor's extent within which centers count as aligned
const ALIGNMENT_FACTOR: f32 = 0.5;

/// Group items sorted by `center` into runs whose centers stay within
/// `ALIGNMENT_FACTOR * extent` of the run's first item
fn group_aligned(mut items: Vec<(usize, f32, f32)>) -> Vec<Vec<usize>> {
    items.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut anchor: Option<(f32, f32)> = None;
    for (idx, center, extent) in items {
        match anchor {
            Some((anchor_center, anchor_extent))
                if (center - anchor_center).abs() < ALIGNMENT_FACTOR * anchor_extent =>
            {
                if let Some(group) = groups.last_mut() {
                    group.push(idx);
                }
            }
            _ => {
                anchor = Some((center, extent));
                groups.push(vec![idx]);
            }
        }
    }
    groups
}

fn panel_indices(detections: &[Detection]) -> Vec<usize> {
    detections
        .iter()
        .enumerate()
        .filter(|(_, d)| d.class == RegionClass::Panel)
        .map(|(i, _)| i)
        .collect()
}

/// Rows of panel indices, top to bottom, each ordered for `direction`
fn panel_rows(detections: &[Detection], direction: ReadingDirection) -> Vec<Vec<usize>> {
    let items = panel_indices(detections)
        .into_iter()
        .map(|i| (i, detections[i].center_y, detections[i].height))
        .collect();

    let mut rows = group_aligned(items);
    for row in rows.iter_mut() {
        row.sort_by(|&a, &b| {
            let ord = detections[a].center_x.total_cmp(&detections[b].center_x);
            match direction {
                ReadingDirection::Ltr => ord,
                ReadingDirection::Rtl => ord.reverse(),
            }
        });
    }
    rows
}

pub struct PanelLayoutAnalyzer;

impl PanelLayoutAnalyzer {
    /// Reorder panel detections into reading order, leaving the relative
    /// order of everything else untouched
    pub fn sort_panels(detections: Vec<Detection>, direction: ReadingDirection) -> Vec<Detection> {
        let order: Vec<usize> = panel_rows(&detections, direction).into_iter().flatten().collect();
        let mut slots: Vec<Option<Detection>> = detections.into_iter().map(Some).collect();

        let panels: Vec<Detection> = order.iter().filter_map(|&i| slots[i].take()).collect();
        let mut out: Vec<Detection> = slots.into_iter().flatten().collect();
        out.extend(panels);
        out
    }

    /// Build the panel layout and set `panel_id` on every other detection.
    ///
    /// Ids must already be assigned. A detection belongs to the panel
    /// covering the largest share of its area; equal shares go to the panel
    /// read first, and no overlap at all leaves it unassigned.
    pub fn analyze(detections: &mut [Detection], direction: ReadingDirection) -> PanelLayout {
        let rows = panel_rows(detections, direction);

        let column_items = panel_indices(detections)
            .into_iter()
            .map(|i| (i, detections[i].center_x, detections[i].width))
            .collect();
        let mut columns = group_aligned(column_items);
        for column in columns.iter_mut() {
            column.sort_by(|&a, &b| detections[a].center_y.total_cmp(&detections[b].center_y));
        }

        let reading: Vec<usize> = rows.iter().flatten().copied().collect();
        let panel_boxes: Vec<(u32, _)> = reading
            .iter()
            .map(|&i| (detections[i].id, detections[i].bbox()))
            .collect();

        let mut assigned = 0usize;
        for detection in detections.iter_mut().filter(|d| d.class != RegionClass::Panel) {
            let bbox = detection.bbox();
            let area = bbox.area();
            let mut best: Option<(u32, f32)> = None;
            if area > 0.0 {
                for (id, panel) in &panel_boxes {
                    let share = bbox.intersection_area(panel) / area;
                    if share > 0.0 && best.map_or(true, |(_, s)| share > s) {
                        best = Some((*id, share));
                    }
                }
            }
            detection.panel_id = best.map(|(id, _)| id);
            if best.is_some() {
                assigned += 1;
            }
        }

        let ids = |groups: Vec<Vec<usize>>| -> Vec<Vec<u32>> {
            groups
                .into_iter()
                .map(|g| g.into_iter().map(|i| detections[i].id).collect())
                .collect()
        };
        let reading_order = reading.iter().map(|&i| detections[i].id).collect();
        let layout = PanelLayout {
            rows: ids(rows),
            columns: ids(columns),
            reading_order,
        };

        debug!(
            "Layout: {} rows, {} columns, {} detections assigned to panels",
            layout.rows.len(),
            layout.columns.len(),
            assigned
        );
        layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BoundingBox, DetectionSource};

    fn detection(id: u32, class: RegionClass, x: f32, y: f32, w: f32, h: f32) -> Detection {
        let mut d = Detection::new(BoundingBox::new(x, y, w, h), 0.8, class, DetectionSource::Heuristic);
        d.id = id;
        d
    }

    /// Two panels on top, one wide panel below
    fn page() -> Vec<Detection> {
        vec![
            detection(0, RegionClass::SpeechBubble, 40.0, 40.0, 60.0, 40.0),
            detection(1, RegionClass::SpeechBubble, 700.0, 900.0, 50.0, 50.0),
            detection(10, RegionClass::Panel, 0.0, 500.0, 600.0, 400.0),
            detection(11, RegionClass::Panel, 310.0, 10.0, 290.0, 440.0),
            detection(12, RegionClass::Panel, 0.0, 0.0, 300.0, 450.0),
        ]
    }

    #[test]
    fn test_reading_order_ltr_and_rtl() {
        let mut dets = page();
        let layout = PanelLayoutAnalyzer::analyze(&mut dets, ReadingDirection::Ltr);
        assert_eq!(layout.reading_order, vec![12, 11, 10]);
        assert_eq!(layout.rows, vec![vec![12, 11], vec![10]]);

        let mut dets = page();
        let layout = PanelLayoutAnalyzer::analyze(&mut dets, ReadingDirection::Rtl);
        assert_eq!(layout.reading_order, vec![11, 12, 10]);
    }

    #[test]
    fn test_columns_group_by_center_x() {
        let mut dets = page();
        let layout = PanelLayoutAnalyzer::analyze(&mut dets, ReadingDirection::Ltr);
        // Centers at x = 150, 300 and 455; the wide panel anchors the second column
        assert_eq!(layout.columns, vec![vec![12], vec![11, 10]]);
    }

    #[test]
    fn test_association_by_largest_overlap() {
        let mut dets = page();
        PanelLayoutAnalyzer::analyze(&mut dets, ReadingDirection::Ltr);
        assert_eq!(dets[0].panel_id, Some(12));
        assert_eq!(dets[1].panel_id, None);
        assert!(dets[2..].iter().all(|d| d.panel_id.is_none()));

        // 20 px inside panel 12, 30 px inside panel 11
        let mut dets = page();
        dets[0] = detection(0, RegionClass::SpeechBubble, 280.0, 100.0, 60.0, 40.0);
        PanelLayoutAnalyzer::analyze(&mut dets, ReadingDirection::Ltr);
        assert_eq!(dets[0].panel_id, Some(11));

        // Straddling the gutter evenly: the panel read first wins
        for (direction, expected) in [(ReadingDirection::Ltr, 12), (ReadingDirection::Rtl, 11)] {
            let mut dets = page();
            dets[0] = detection(0, RegionClass::SpeechBubble, 285.0, 100.0, 40.0, 40.0);
            PanelLayoutAnalyzer::analyze(&mut dets, direction);
            assert_eq!(dets[0].panel_id, Some(expected));
        }
    }

    #[test]
    fn test_sort_panels_into_reading_order() {
        let sorted = PanelLayoutAnalyzer::sort_panels(page(), ReadingDirection::Ltr);
        let ids: Vec<u32> = sorted.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1, 12, 11, 10]);
    }
}
