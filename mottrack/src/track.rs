//! Single-track state: Kalman-filtered box plus the confirmation lifecycle

use crate::bbox::Bbox;
use crate::kalman::{KalmanFilter, KalmanFilterParams};
use anyhow::Result;
use nalgebra::{DMatrix, DVector};

/// Lifecycle of a track.
///
/// A track is born `Tentative`, becomes `Confirmed` after `n_init`
/// consecutive detection hits, and is `Deleted` once it has gone more than
/// `max_age` steps without an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct TrackParams {
    pub id: u32,
    pub bbox: Bbox,
    pub label: String,
    /// Consecutive hits required before confirmation
    pub n_init: u32,
    /// Diagonal of the measurement noise covariance for (x, y, s, r);
    /// default `[1, 1, 10, 10]`
    pub meas_var: Option<[f32; 4]>,
    /// Diagonal of the process noise covariance for (x, y, s, r, dx, dy, ds);
    /// default `[1, 1, 1, 1, 0.01, 0.01, 0.0001]`
    pub proc_var: Option<[f32; 7]>,
}

/// A single tracked object
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub label: String,
    kf: KalmanFilter,
    state: TrackState,
    n_init: u32,
    /// Steps the track has been alive (each predict is one step)
    pub age: u32,
    /// Total matched detections
    pub hits: u32,
    /// Consecutive steps with a matched detection
    pub hit_streak: u32,
    /// Consecutive steps predicted without a detection
    pub steps_since_update: u32,
}

impl Track {
    pub fn new(p: TrackParams) -> Self {
        let meas_var = p.meas_var.unwrap_or([1.0, 1.0, 10.0, 10.0]);
        let proc_var = p
            .proc_var
            .unwrap_or([1.0, 1.0, 1.0, 1.0, 0.01, 0.01, 0.0001]);

        // State: [center_x, center_y, area, aspect_ratio, vel_x, vel_y, vel_area]
        let z = p.bbox.to_z();
        let initial_state = DVector::from_vec(vec![z[0], z[1], z[2], z[3], 0.0, 0.0, 0.0]);

        let params = KalmanFilterParams {
            dim_x: 7,
            dim_z: 4,
            x: initial_state,
            p: DMatrix::from_diagonal(&DVector::from_vec(vec![
                10.0, 10.0, 10.0, 10.0, 10000.0, 10000.0, 10000.0,
            ])),
            f: DMatrix::from_row_slice(
                7,
                7,
                &[
                    1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, // center_x' = center_x + vel_x
                    0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, // center_y' = center_y + vel_y
                    0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, // area' = area + vel_area
                    0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, // aspect_ratio' = aspect_ratio
                    0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, // vel_x' = vel_x
                    0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, // vel_y' = vel_y
                    0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, // vel_area' = vel_area
                ],
            ),
            h: DMatrix::from_row_slice(
                4,
                7,
                &[
                    1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
                    0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
                    0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, //
                    0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0,
                ],
            ),
            r: DMatrix::from_diagonal(&DVector::from_vec(meas_var.to_vec())),
            q: DMatrix::from_diagonal(&DVector::from_vec(proc_var.to_vec())),
        };

        Track {
            id: p.id,
            label: p.label,
            kf: KalmanFilter::new(params),
            state: TrackState::Tentative,
            n_init: p.n_init,
            age: 0,
            hits: 0,
            hit_streak: 0,
            steps_since_update: 0,
        }
    }

    /// Fold in a matched detection box
    pub fn update(&mut self, bbox: Bbox) -> Result<()> {
        // Several updates in the same step only count once
        if self.steps_since_update > 0 {
            self.hits += 1;
            self.hit_streak += 1;
        }
        self.steps_since_update = 0;

        if self.state == TrackState::Tentative && self.hit_streak >= self.n_init {
            self.state = TrackState::Confirmed;
        }

        let z = bbox.to_z();
        self.kf.update(DVector::from_vec(z.to_vec()))?;
        Ok(())
    }

    /// Advance the track one step and return the predicted box.
    ///
    /// Coasting (predict without update) never advances hit counts; it only
    /// ages the track toward deletion.
    pub fn predict(&mut self, max_age: u32) -> Bbox {
        // Clamp area velocity so predictions cannot go negative-area
        if self.kf.x[6] + self.kf.x[2] <= 0.0 {
            self.kf.x[6] = 0.0;
        }

        self.kf.predict();
        self.age += 1;

        if self.steps_since_update > 0 {
            self.hit_streak = 0;
        }
        self.steps_since_update += 1;

        if self.steps_since_update > max_age {
            self.state = TrackState::Deleted;
        }

        self.bbox()
    }

    /// Current box from the filter state
    pub fn bbox(&self) -> Bbox {
        let state = self.kf.state();
        Bbox::from_z(&[state[0], state[1], state[2], state[3]])
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }

    pub fn is_deleted(&self) -> bool {
        self.state == TrackState::Deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_track(n_init: u32) -> Track {
        Track::new(TrackParams {
            id: 1,
            bbox: Bbox::new(0.0, 0.0, 10.0, 5.0),
            label: "person".to_string(),
            n_init,
            meas_var: None,
            proc_var: None,
        })
    }

    #[test]
    fn test_update_moves_prediction() {
        let mut track = make_track(1);
        let pred1 = track.predict(5);
        track.update(Bbox::new(5.0, 0.0, 15.0, 4.5)).unwrap();
        let pred2 = track.predict(5);

        assert!(pred2.center_x() != pred1.center_x());
        assert_eq!(track.hits, 1);
        assert_eq!(track.age, 2);
    }

    #[test]
    fn test_confirmation_after_n_init_hits() {
        let mut track = make_track(3);
        assert_eq!(track.state(), TrackState::Tentative);

        for i in 0..3 {
            track.predict(10);
            track
                .update(Bbox::new(i as f32, 0.0, 10.0 + i as f32, 5.0))
                .unwrap();
        }
        assert_eq!(track.state(), TrackState::Confirmed);
    }

    #[test]
    fn test_missed_step_resets_streak() {
        let mut track = make_track(3);
        track.predict(10);
        track.update(Bbox::new(0.0, 0.0, 10.0, 5.0)).unwrap();
        // Two coasting steps break the streak
        track.predict(10);
        track.predict(10);
        track.predict(10);
        track.update(Bbox::new(1.0, 0.0, 11.0, 5.0)).unwrap();
        assert_eq!(track.state(), TrackState::Tentative);
        assert_eq!(track.hit_streak, 1);
    }

    #[test]
    fn test_deletion_after_max_age() {
        let mut track = make_track(1);
        track.predict(10);
        track.update(Bbox::new(0.0, 0.0, 10.0, 5.0)).unwrap();

        for _ in 0..3 {
            track.predict(2);
        }
        assert!(track.is_deleted());
    }

    #[test]
    fn test_coasting_does_not_confirm() {
        let mut track = make_track(2);
        let hits_before = track.hits;
        for _ in 0..5 {
            track.predict(10);
        }
        assert_eq!(track.hits, hits_before);
        assert_ne!(track.state(), TrackState::Confirmed);
    }
}
