//! Kalman prediction through skipped and undetected frames
//!
//! Two pieces: a per-camera bank of coasting trackers that turns the last
//! known detections into predicted boxes, and the gate bounding what
//! fraction of a camera's frames may be predictions.

use crate::envelope::Detection;
use mottrack::{Bbox, InputDetection, MultiObjectTracker, TrackerConfig};
use std::collections::HashMap;

/// Confidence attached to Kalman-predicted boxes
pub const PREDICTED_SCORE: f32 = 0.5;

/// Bounds predictions to `predicted / observed < factor` per camera.
///
/// `observed` counts every frame seen for the camera, real or skipped, so a
/// factor of 0.5 lets at most half of a camera's output be synthesized.
pub struct PredictionGate {
    factor: f32,
    observed: HashMap<String, u64>,
    predicted: HashMap<String, u64>,
}

impl PredictionGate {
    pub fn new(factor: f32) -> Self {
        Self {
            factor,
            observed: HashMap::new(),
            predicted: HashMap::new(),
        }
    }

    /// Count a frame (real or skipped) for this camera
    pub fn record_observed(&mut self, camera_id: &str) {
        *self.observed.entry(camera_id.to_string()).or_insert(0) += 1;
    }

    /// Whether another prediction for this camera stays under the bound
    pub fn allow(&self, camera_id: &str) -> bool {
        if self.factor <= 0.0 {
            return false;
        }
        let observed = self.observed.get(camera_id).copied().unwrap_or(0);
        let predicted = self.predicted.get(camera_id).copied().unwrap_or(0);
        observed > 0 && (predicted as f64) < (observed as f64) * self.factor as f64
    }

    pub fn record_predicted(&mut self, camera_id: &str) {
        *self.predicted.entry(camera_id.to_string()).or_insert(0) += 1;
    }

    pub fn predicted_count(&self, camera_id: &str) -> u64 {
        self.predicted.get(camera_id).copied().unwrap_or(0)
    }
}

/// Per-camera coasting predictors fed by real detections
pub struct PredictorBank {
    config: TrackerConfig,
    trackers: HashMap<String, MultiObjectTracker>,
}

impl PredictorBank {
    pub fn new() -> Self {
        // Immediate confirmation: the bank exists to coast, not to filter
        let config = TrackerConfig {
            n_init: 1,
            max_age: 30,
            ..TrackerConfig::default()
        };
        Self {
            config,
            trackers: HashMap::new(),
        }
    }

    fn tracker(&mut self, camera_id: &str) -> &mut MultiObjectTracker {
        let config = self.config.clone();
        self.trackers
            .entry(camera_id.to_string())
            .or_insert_with(|| MultiObjectTracker::new(config))
    }

    /// Fold a real detection set into the camera's predictor state
    pub fn observe(&mut self, camera_id: &str, detections: &[Detection]) {
        let inputs: Vec<InputDetection> = detections
            .iter()
            .map(|d| InputDetection {
                bbox: Bbox::from_xywh(d.bbox),
                score: d.score,
                label: d.class_id.clone(),
            })
            .collect();
        if let Err(e) = self.tracker(camera_id).update(&inputs, false) {
            log::warn!("camera {camera_id}: predictor update failed: {e}");
        }
    }

    /// One predict-only step: boxes for where the last detections should be
    /// by now, flagged as predicted.
    pub fn predict(&mut self, camera_id: &str) -> Vec<Detection> {
        self.tracker(camera_id)
            .predict_only()
            .into_iter()
            .filter(|t| t.bbox.is_valid())
            .map(|t| Detection {
                bbox: t.bbox.to_xywh(),
                score: PREDICTED_SCORE,
                class_id: t.label,
                reid_id: None,
                predicted: Some(true),
            })
            .collect()
    }
}

impl Default for PredictorBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32) -> Detection {
        Detection {
            bbox: [x, y, 40.0, 40.0],
            score: 0.9,
            class_id: "person".to_string(),
            reid_id: None,
            predicted: None,
        }
    }

    #[test]
    fn test_gate_disabled_at_zero_factor() {
        let mut gate = PredictionGate::new(0.0);
        gate.record_observed("cam-1");
        assert!(!gate.allow("cam-1"));
    }

    #[test]
    fn test_gate_caps_predicted_fraction() {
        // 100 frames at 30 fps with detections on every third frame: 33
        // detected, 67 candidates. A factor of 0.5 admits exactly 50.
        let mut gate = PredictionGate::new(0.5);

        for _ in 0..33 {
            gate.record_observed("cam-1");
        }
        let mut allowed = 0u64;
        for _ in 0..67 {
            gate.record_observed("cam-1");
            if gate.allow("cam-1") {
                gate.record_predicted("cam-1");
                allowed += 1;
            }
        }
        assert_eq!(allowed, 50);
        assert_eq!(gate.predicted_count("cam-1"), 50);
    }

    #[test]
    fn test_gate_is_per_camera() {
        let mut gate = PredictionGate::new(0.5);
        gate.record_observed("cam-1");
        gate.record_observed("cam-1");
        gate.record_observed("cam-2");

        assert!(gate.allow("cam-1"));
        gate.record_predicted("cam-1");
        assert_eq!(gate.predicted_count("cam-2"), 0);
    }

    #[test]
    fn test_bank_predicts_after_observation() {
        let mut bank = PredictorBank::new();
        bank.observe("cam-1", &[det(100.0, 100.0)]);
        bank.observe("cam-1", &[det(110.0, 100.0)]);

        let predicted = bank.predict("cam-1");
        assert_eq!(predicted.len(), 1);
        assert_eq!(predicted[0].predicted, Some(true));
        assert_eq!(predicted[0].class_id, "person");
        // The box keeps moving in the observed direction
        assert!(predicted[0].bbox[0] > 105.0);
    }

    #[test]
    fn test_bank_with_no_history_predicts_nothing() {
        let mut bank = PredictorBank::new();
        assert!(bank.predict("cam-9").is_empty());
    }
}
