//! Bounding box operations, IoU calculations and non-maximum suppression

use ndarray::prelude::*;
use rayon::prelude::*;
use std::fmt;

/// Axis-aligned bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Build from `[x, y, w, h]` (top-left plus extent), the wire format
    /// the pipeline stages exchange.
    pub fn from_xywh(xywh: [f32; 4]) -> Self {
        Self {
            xmin: xywh[0],
            ymin: xywh[1],
            xmax: xywh[0] + xywh[2],
            ymax: xywh[1] + xywh[3],
        }
    }

    pub fn to_xywh(&self) -> [f32; 4] {
        [self.xmin, self.ymin, self.width(), self.height()]
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center_x(&self) -> f32 {
        (self.xmin + self.xmax) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.ymin + self.ymax) / 2.0
    }

    /// Convert to bounds array `[xmin, ymin, xmax, ymax]`
    pub fn to_bounds(&self) -> [f32; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }

    /// Convert to the Kalman measurement vector
    /// `[center_x, center_y, area, aspect_ratio]`
    pub fn to_z(&self) -> [f32; 4] {
        let w = self.width();
        let h = self.height();
        let aspect_ratio = if h != 0.0 { w / h } else { 1.0 };
        [self.center_x(), self.center_y(), w * h, aspect_ratio]
    }

    /// Create from the measurement vector `[center_x, center_y, area, aspect_ratio]`
    pub fn from_z(z: &[f32; 4]) -> Self {
        let h = (z[2] / z[3]).abs().sqrt();
        let w = z[3] * h;
        Self {
            xmin: z[0] - w / 2.0,
            ymin: z[1] - h / 2.0,
            xmax: z[0] + w / 2.0,
            ymax: z[1] + h / 2.0,
        }
    }

    /// A box is usable when it has positive extent and finite coordinates.
    pub fn is_valid(&self) -> bool {
        self.xmin < self.xmax
            && self.ymin < self.ymax
            && self.to_bounds().iter().all(|v| v.is_finite())
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bbox({}, {}, {}, {})",
            self.xmin, self.ymin, self.xmax, self.ymax
        )
    }
}

/// Calculate IoU between two bounding boxes
pub fn calculate_iou(a: &Bbox, b: &Bbox) -> f32 {
    let x1 = a.xmin.max(b.xmin);
    let y1 = a.ymin.max(b.ymin);
    let x2 = a.xmax.min(b.xmax);
    let y2 = a.ymax.min(b.ymax);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = a.area() + b.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Compute the IoU matrix between detection and track box rows.
/// Rows are `[xmin, ymin, xmax, ymax, ..]`; extra columns are ignored.
/// Returns an `(n_detections, n_tracks)` matrix.
pub fn iou_matrix(detections: ArrayView2<f32>, tracks: ArrayView2<f32>) -> Array2<f32> {
    let n_dets = detections.nrows();
    let n_tracks = tracks.nrows();

    if n_dets == 0 || n_tracks == 0 {
        return Array2::zeros((n_dets, n_tracks));
    }

    let iou_data: Vec<f32> = (0..n_dets)
        .into_par_iter()
        .flat_map(|i| {
            let det_row = detections.row(i);
            if det_row.len() < 4 {
                return vec![0.0; n_tracks];
            }
            let det_bbox = Bbox::new(det_row[0], det_row[1], det_row[2], det_row[3]);

            (0..n_tracks)
                .map(|j| {
                    let track_row = tracks.row(j);
                    if track_row.len() < 4 {
                        return 0.0;
                    }
                    let track_bbox =
                        Bbox::new(track_row[0], track_row[1], track_row[2], track_row[3]);
                    calculate_iou(&det_bbox, &track_bbox)
                })
                .collect::<Vec<_>>()
        })
        .collect();

    Array2::from_shape_vec((n_dets, n_tracks), iou_data).unwrap_or_else(|_| {
        // Shape mismatch is impossible given the loop above
        Array2::zeros((n_dets, n_tracks))
    })
}

/// Non-maximum suppression over scored boxes.
///
/// Returns the indices (into the input slice) of boxes that survive, in
/// descending score order. Boxes overlapping a kept box above `max_overlap`
/// are suppressed.
pub fn nms_keep(boxes: &[(Bbox, f32)], max_overlap: f32) -> Vec<usize> {
    if boxes.is_empty() || max_overlap >= 1.0 {
        return (0..boxes.len()).collect();
    }

    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| {
        boxes[b]
            .1
            .partial_cmp(&boxes[a].1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::with_capacity(boxes.len());
    let mut suppressed = vec![false; boxes.len()];

    for (rank, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order[rank + 1..] {
            if !suppressed[j] && calculate_iou(&boxes[i].0, &boxes[j].0) > max_overlap {
                suppressed[j] = true;
            }
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_bbox_creation() {
        let bbox = Bbox::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(bbox.width(), 10.0);
        assert_eq!(bbox.height(), 10.0);
        assert_eq!(bbox.area(), 100.0);
        assert_eq!(bbox.center_x(), 5.0);
    }

    #[test]
    fn test_xywh_round_trip() {
        let bbox = Bbox::from_xywh([10.0, 20.0, 30.0, 40.0]);
        assert_eq!(bbox.xmax, 40.0);
        assert_eq!(bbox.ymax, 60.0);
        assert_eq!(bbox.to_xywh(), [10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_z_conversion_consistency() {
        let bbox = Bbox::new(10.0, 20.0, 30.0, 40.0);
        let z = bbox.to_z();
        let back = Bbox::from_z(&z);

        assert_abs_diff_eq!(bbox.xmin, back.xmin, epsilon = 0.001);
        assert_abs_diff_eq!(bbox.ymin, back.ymin, epsilon = 0.001);
        assert_abs_diff_eq!(bbox.xmax, back.xmax, epsilon = 0.001);
        assert_abs_diff_eq!(bbox.ymax, back.ymax, epsilon = 0.001);
    }

    #[test]
    fn test_iou_disjoint_and_identical() {
        let a = Bbox::new(0.0, 0.0, 10.0, 10.0);
        let b = Bbox::new(20.0, 20.0, 30.0, 30.0);
        assert_abs_diff_eq!(calculate_iou(&a, &b), 0.0);
        assert_abs_diff_eq!(calculate_iou(&a, &a), 1.0, epsilon = 0.0001);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = Bbox::new(0.0, 0.0, 10.0, 10.0);
        let b = Bbox::new(5.0, 0.0, 15.0, 10.0);
        // intersection 50, union 150
        assert_abs_diff_eq!(calculate_iou(&a, &b), 1.0 / 3.0, epsilon = 0.0001);
    }

    #[test]
    fn test_iou_matrix_shape() {
        let dets = array![[0.0, 0.0, 10.0, 10.0, 0.9], [5.0, 5.0, 15.0, 15.0, 0.8]];
        let tracks = array![[0.0, 0.0, 10.0, 10.0, 1.0]];
        let m = iou_matrix(dets.view(), tracks.view());
        assert_eq!(m.shape(), &[2, 1]);
        assert_abs_diff_eq!(m[[0, 0]], 1.0, epsilon = 0.0001);
    }

    #[test]
    fn test_nms_suppresses_duplicates() {
        let boxes = vec![
            (Bbox::new(0.0, 0.0, 10.0, 10.0), 0.9),
            (Bbox::new(1.0, 1.0, 11.0, 11.0), 0.8),
            (Bbox::new(50.0, 50.0, 60.0, 60.0), 0.7),
        ];
        let keep = nms_keep(&boxes, 0.5);
        assert_eq!(keep, vec![0, 2]);
    }

    #[test]
    fn test_nms_threshold_one_keeps_everything() {
        let boxes = vec![
            (Bbox::new(0.0, 0.0, 10.0, 10.0), 0.9),
            (Bbox::new(0.0, 0.0, 10.0, 10.0), 0.1),
        ];
        assert_eq!(nms_keep(&boxes, 1.0).len(), 2);
    }
}
