//! Multi-object tracker: NMS, Hungarian association and track lifecycle

use crate::bbox::{iou_matrix, nms_keep, Bbox};
use crate::hungarian::HungarianSolver;
use crate::track::{Track, TrackParams};
use anyhow::Result;
use ndarray::prelude::*;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Tracker tuning knobs
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Steps a track may coast without a detection before deletion
    pub max_age: u32,
    /// Consecutive hits before a tentative track is confirmed
    pub n_init: u32,
    /// Maximum assignment distance (1 - IoU); pairs above it are rejected
    pub max_iou_distance: f32,
    /// NMS overlap applied to detections before association; 1.0 disables
    pub nms_max_overlap: f32,
    /// Minimum detection score for spawning a new track
    pub init_score_threshold: f32,
    pub measurement_noise: [f32; 4],
    pub process_noise: [f32; 7],
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            n_init: 3,
            max_iou_distance: 0.7,
            nms_max_overlap: 1.0,
            init_score_threshold: 0.25,
            measurement_noise: [1.0, 1.0, 10.0, 10.0],
            process_noise: [1.0, 1.0, 1.0, 1.0, 0.01, 0.01, 0.0001],
        }
    }
}

/// One detection handed to the tracker
#[derive(Debug, Clone)]
pub struct InputDetection {
    pub bbox: Bbox,
    pub score: f32,
    pub label: String,
}

/// One track row returned from an update or predict step
#[derive(Debug, Clone)]
pub struct TrackOutput {
    pub track_id: u32,
    pub bbox: Bbox,
    pub label: String,
    pub confirmed: bool,
}

/// Per-camera multi-object tracker
#[derive(Debug, Clone)]
pub struct MultiObjectTracker {
    config: TrackerConfig,
    next_track_id: u32,
    tracks: BTreeMap<u32, Track>,
    n_steps: u32,
}

impl MultiObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            next_track_id: 1,
            tracks: BTreeMap::new(),
            n_steps: 0,
        }
    }

    /// Predict every live track one step, dropping tracks whose state went
    /// invalid or whose age exceeded the limit. Returns `[x1,y1,x2,y2,id]`
    /// rows for association.
    fn predict_and_cleanup(&mut self) -> Array2<f32> {
        let max_age = self.config.max_age;

        let track_data: Vec<(u32, Vec<f32>)> = self
            .tracks
            .par_iter_mut()
            .filter_map(|(track_id, track)| {
                let b = track.predict(max_age);
                if track.is_deleted() || !b.is_valid() {
                    None
                } else {
                    let mut data = b.to_bounds().to_vec();
                    data.push(*track_id as f32);
                    Some((*track_id, data))
                }
            })
            .collect();

        let valid_ids: std::collections::HashSet<u32> =
            track_data.iter().map(|(id, _)| *id).collect();
        self.tracks.retain(|id, _| valid_ids.contains(id));

        let mut data = Vec::with_capacity(track_data.len() * 5);
        for (_, row) in track_data {
            data.extend(row);
        }

        if data.is_empty() {
            Array2::zeros((0, 5))
        } else {
            Array2::from_shape_vec((data.len() / 5, 5), data)
                .unwrap_or_else(|_| Array2::zeros((0, 5)))
        }
    }

    /// Main update: predict, associate with Hungarian over IoU, update
    /// matched tracks, spawn tentative tracks from leftovers.
    pub fn update(
        &mut self,
        detections: &[InputDetection],
        only_confirmed: bool,
    ) -> Result<Vec<TrackOutput>> {
        // Step 1: suppress duplicate detections
        let scored: Vec<(Bbox, f32)> = detections.iter().map(|d| (d.bbox, d.score)).collect();
        let keep = nms_keep(&scored, self.config.nms_max_overlap);
        let detections: Vec<&InputDetection> = keep.iter().map(|&i| &detections[i]).collect();

        // Step 2: predict current tracks forward
        let track_boxes = self.predict_and_cleanup();

        // Step 3: associate
        let det_rows: Vec<f32> = detections
            .iter()
            .flat_map(|d| {
                let b = d.bbox.to_bounds();
                [b[0], b[1], b[2], b[3], d.score]
            })
            .collect();
        let det_matrix = if det_rows.is_empty() {
            Array2::zeros((0, 5))
        } else {
            Array2::from_shape_vec((detections.len(), 5), det_rows)
                .unwrap_or_else(|_| Array2::zeros((0, 5)))
        };

        let ious = iou_matrix(det_matrix.view(), track_boxes.view());
        let min_iou = 1.0 - self.config.max_iou_distance;
        let assignment = HungarianSolver::solve_iou(ious.view(), min_iou);

        // Step 4: update matched tracks
        for (det_idx, track_idx) in &assignment.assignments {
            let track_id = track_boxes[[*track_idx, 4]] as u32;
            let det = detections[*det_idx];
            if let Some(track) = self.tracks.get_mut(&track_id) {
                if track.update(det.bbox).is_err() {
                    // Degenerate filter state, retire the track
                    self.tracks.remove(&track_id);
                }
            }
        }

        // Step 5: spawn tentative tracks from unmatched detections
        for det_idx in &assignment.unassigned_detections {
            let det = detections[*det_idx];
            if det.score >= self.config.init_score_threshold {
                self.tracks.insert(
                    self.next_track_id,
                    Track::new(TrackParams {
                        id: self.next_track_id,
                        bbox: det.bbox,
                        label: det.label.clone(),
                        n_init: self.config.n_init,
                        meas_var: Some(self.config.measurement_noise),
                        proc_var: Some(self.config.process_noise),
                    }),
                );
                self.next_track_id += 1;
            }
        }

        self.n_steps += 1;
        Ok(self.current_tracks(only_confirmed, false))
    }

    /// Coast every live track one step without detections.
    ///
    /// Hit counts are untouched; returns the predicted positions of tracks
    /// that were already confirmed before the step.
    pub fn predict_only(&mut self) -> Vec<TrackOutput> {
        let max_age = self.config.max_age;
        for track in self.tracks.values_mut() {
            track.predict(max_age);
        }
        self.tracks.retain(|_, t| !t.is_deleted());
        self.n_steps += 1;
        self.current_tracks(true, true)
    }

    /// Snapshot of live tracks.
    ///
    /// Outside the warm-up window a track is reported only when it was
    /// updated this step and has a sufficient streak, unless `include_stale`.
    fn current_tracks(&self, only_confirmed: bool, include_stale: bool) -> Vec<TrackOutput> {
        self.tracks
            .values()
            .filter(|t| {
                if only_confirmed && !t.is_confirmed() {
                    return false;
                }
                include_stale
                    || t.steps_since_update < 1
                    || self.n_steps <= self.config.n_init
            })
            .map(|t| TrackOutput {
                track_id: t.id,
                bbox: t.bbox(),
                label: t.label.clone(),
                confirmed: t.is_confirmed(),
            })
            .collect()
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.next_track_id = 1;
        self.n_steps = 0;
    }

    /// Confirmed-track count, used by the stages for diagnostics
    pub fn num_confirmed(&self) -> usize {
        self.tracks.values().filter(|t| t.is_confirmed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, size: f32, score: f32) -> InputDetection {
        InputDetection {
            bbox: Bbox::new(x, y, x + size, y + size),
            score,
            label: "person".to_string(),
        }
    }

    fn config(n_init: u32, max_age: u32) -> TrackerConfig {
        TrackerConfig {
            max_age,
            n_init,
            max_iou_distance: 0.7,
            nms_max_overlap: 1.0,
            init_score_threshold: 0.25,
            ..TrackerConfig::default()
        }
    }

    #[test]
    fn test_tracks_created_and_ids_stable() {
        let mut tracker = MultiObjectTracker::new(config(1, 5));

        let first = tracker
            .update(&[det(10.0, 10.0, 40.0, 0.9), det(100.0, 100.0, 40.0, 0.8)], false)
            .unwrap();
        assert_eq!(first.len(), 2);

        // Slight motion keeps the same ids
        let second = tracker
            .update(&[det(12.0, 10.0, 40.0, 0.9), det(102.0, 100.0, 40.0, 0.8)], false)
            .unwrap();
        let mut ids: Vec<u32> = second.iter().map(|t| t.track_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_low_score_detection_spawns_nothing() {
        let mut tracker = MultiObjectTracker::new(config(1, 5));
        tracker.update(&[det(0.0, 0.0, 20.0, 0.1)], false).unwrap();
        assert_eq!(tracker.num_tracks(), 0);
    }

    #[test]
    fn test_confirmation_lifecycle() {
        let mut tracker = MultiObjectTracker::new(config(3, 10));

        for step in 0..4 {
            tracker
                .update(&[det(10.0 + step as f32, 10.0, 40.0, 0.9)], false)
                .unwrap();
        }
        assert_eq!(tracker.num_confirmed(), 1);

        // only_confirmed filters tentative newcomers
        let out = tracker
            .update(
                &[det(14.0, 10.0, 40.0, 0.9), det(300.0, 300.0, 40.0, 0.9)],
                true,
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].confirmed);
    }

    #[test]
    fn test_track_expires_without_detections() {
        let mut tracker = MultiObjectTracker::new(config(1, 2));
        tracker.update(&[det(10.0, 10.0, 40.0, 0.9)], false).unwrap();
        assert_eq!(tracker.num_tracks(), 1);

        for _ in 0..4 {
            tracker.update(&[], false).unwrap();
        }
        assert_eq!(tracker.num_tracks(), 0);
    }

    #[test]
    fn test_predict_only_keeps_hits_frozen() {
        let mut tracker = MultiObjectTracker::new(config(1, 10));
        for step in 0..3 {
            tracker
                .update(&[det(10.0 + step as f32, 10.0, 40.0, 0.9)], false)
                .unwrap();
        }
        assert_eq!(tracker.num_confirmed(), 1);

        let coasted = tracker.predict_only();
        assert_eq!(coasted.len(), 1);
        assert!(coasted[0].confirmed);

        // Predicted box keeps drifting in the motion direction
        let again = tracker.predict_only();
        assert!(again[0].bbox.center_x() >= coasted[0].bbox.center_x());
    }

    #[test]
    fn test_nms_collapses_duplicates_before_association() {
        let mut tracker = MultiObjectTracker::new(TrackerConfig {
            nms_max_overlap: 0.5,
            n_init: 1,
            ..config(1, 5)
        });

        // Two near-identical boxes collapse to one track
        tracker
            .update(
                &[det(10.0, 10.0, 40.0, 0.9), det(11.0, 10.0, 40.0, 0.5)],
                false,
            )
            .unwrap();
        assert_eq!(tracker.num_tracks(), 1);
    }
}
