//! Hungarian algorithm for optimal detection-to-track assignment

use ndarray::ArrayView2;
use pathfinding::prelude::{kuhn_munkres_min, Matrix};

/// Result of an assignment solve
#[derive(Debug, Clone)]
pub struct AssignmentResult {
    /// Accepted `(detection_idx, track_idx)` pairs
    pub assignments: Vec<(usize, usize)>,
    /// Detections left without a track
    pub unassigned_detections: Vec<usize>,
    /// Tracks left without a detection
    pub unassigned_tracks: Vec<usize>,
}

pub struct HungarianSolver;

impl HungarianSolver {
    /// Solve the assignment problem over a cost matrix.
    ///
    /// `cost_matrix[[i, j]]` is the cost of assigning detection `i` to track
    /// `j`; pairs whose cost exceeds `threshold` are rejected even when the
    /// global optimum would pick them.
    pub fn solve(cost_matrix: ArrayView2<f32>, threshold: f32) -> AssignmentResult {
        let num_detections = cost_matrix.nrows();
        let num_tracks = cost_matrix.ncols();

        if num_detections == 0 || num_tracks == 0 {
            return AssignmentResult {
                assignments: Vec::new(),
                unassigned_detections: (0..num_detections).collect(),
                unassigned_tracks: (0..num_tracks).collect(),
            };
        }

        // Very sparse matrices are cheaper to solve greedily
        let valid_count = cost_matrix.iter().filter(|&&x| x <= threshold).count();
        if valid_count < (num_detections * num_tracks) / 4 {
            return Self::solve_greedy(cost_matrix, threshold);
        }

        Self::solve_hungarian(cost_matrix, threshold)
    }

    /// Convenience wrapper: assignment over an IoU matrix with a minimum-IoU
    /// gate. Internally cost = 1 - IoU.
    pub fn solve_iou(iou_matrix: ArrayView2<f32>, min_iou: f32) -> AssignmentResult {
        let cost = iou_matrix.mapv(|v| 1.0 - v);
        Self::solve(cost.view(), 1.0 - min_iou)
    }

    fn solve_hungarian(cost_matrix: ArrayView2<f32>, threshold: f32) -> AssignmentResult {
        let num_detections = cost_matrix.nrows();
        let num_tracks = cost_matrix.ncols();

        // kuhn_munkres wants a square integer matrix; pad with a large
        // sentinel cost so dummy pairings never win.
        const SCALE: f32 = 1000.0;
        let max_cost = 1_000_000i64;
        let threshold_int = (threshold * SCALE) as i64;

        let size = num_detections.max(num_tracks);
        let mut int_cost = Matrix::new(size, size, max_cost);
        for i in 0..num_detections {
            for j in 0..num_tracks {
                int_cost[(i, j)] = (cost_matrix[[i, j]] * SCALE) as i64;
            }
        }

        let (_total, raw_assignments) = kuhn_munkres_min(&int_cost);

        let assignments: Vec<(usize, usize)> = raw_assignments
            .iter()
            .enumerate()
            .filter(|&(det_idx, &track_idx)| {
                det_idx < num_detections
                    && track_idx < num_tracks
                    && int_cost[(det_idx, track_idx)] <= threshold_int
            })
            .map(|(det_idx, &track_idx)| (det_idx, track_idx))
            .collect();

        Self::collect_unassigned(assignments, num_detections, num_tracks)
    }

    /// Greedy fallback: repeatedly take the globally cheapest remaining pair.
    fn solve_greedy(cost_matrix: ArrayView2<f32>, threshold: f32) -> AssignmentResult {
        let num_detections = cost_matrix.nrows();
        let num_tracks = cost_matrix.ncols();

        let mut candidates: Vec<(usize, usize, f32)> = Vec::new();
        for i in 0..num_detections {
            for j in 0..num_tracks {
                let cost = cost_matrix[[i, j]];
                if cost <= threshold {
                    candidates.push((i, j, cost));
                }
            }
        }
        candidates.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut det_taken = vec![false; num_detections];
        let mut track_taken = vec![false; num_tracks];
        let mut assignments = Vec::new();

        for (det_idx, track_idx, _) in candidates {
            if !det_taken[det_idx] && !track_taken[track_idx] {
                det_taken[det_idx] = true;
                track_taken[track_idx] = true;
                assignments.push((det_idx, track_idx));
            }
        }

        Self::collect_unassigned(assignments, num_detections, num_tracks)
    }

    fn collect_unassigned(
        assignments: Vec<(usize, usize)>,
        num_detections: usize,
        num_tracks: usize,
    ) -> AssignmentResult {
        let unassigned_detections = (0..num_detections)
            .filter(|d| !assignments.iter().any(|(ad, _)| ad == d))
            .collect();
        let unassigned_tracks = (0..num_tracks)
            .filter(|t| !assignments.iter().any(|(_, at)| at == t))
            .collect();

        AssignmentResult {
            assignments,
            unassigned_detections,
            unassigned_tracks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_empty_matrix() {
        let cost = ndarray::Array2::<f32>::zeros((0, 3));
        let result = HungarianSolver::solve(cost.view(), 0.5);
        assert!(result.assignments.is_empty());
        assert_eq!(result.unassigned_tracks, vec![0, 1, 2]);
    }

    #[test]
    fn test_diagonal_assignment() {
        let cost = array![[0.1, 0.9, 0.9], [0.9, 0.1, 0.9], [0.9, 0.9, 0.1]];
        let result = HungarianSolver::solve(cost.view(), 0.5);
        let mut assignments = result.assignments.clone();
        assignments.sort();
        assert_eq!(assignments, vec![(0, 0), (1, 1), (2, 2)]);
        assert!(result.unassigned_detections.is_empty());
    }

    #[test]
    fn test_threshold_rejects_expensive_pairs() {
        let cost = array![[0.9, 0.95], [0.95, 0.9]];
        let result = HungarianSolver::solve(cost.view(), 0.5);
        assert!(result.assignments.is_empty());
        assert_eq!(result.unassigned_detections.len(), 2);
        assert_eq!(result.unassigned_tracks.len(), 2);
    }

    #[test]
    fn test_rectangular_more_detections() {
        let cost = array![[0.1, 0.8], [0.8, 0.1], [0.2, 0.2]];
        let result = HungarianSolver::solve(cost.view(), 0.5);
        assert_eq!(result.assignments.len(), 2);
        assert_eq!(result.unassigned_detections.len(), 1);
    }

    #[test]
    fn test_solve_iou_gating() {
        // IoU 0.8 passes a 0.3 gate, IoU 0.1 does not
        let ious = array![[0.8, 0.0], [0.0, 0.1]];
        let result = HungarianSolver::solve_iou(ious.view(), 0.3);
        assert_eq!(result.assignments, vec![(0, 0)]);
        assert_eq!(result.unassigned_detections, vec![1]);
    }

    #[test]
    fn test_greedy_matches_hungarian_on_sparse() {
        // One valid pair in a 4x4 grid triggers the greedy path
        let mut cost = ndarray::Array2::<f32>::from_elem((4, 4), 10.0);
        cost[[2, 1]] = 0.05;
        let result = HungarianSolver::solve(cost.view(), 0.5);
        assert_eq!(result.assignments, vec![(2, 1)]);
    }
}
