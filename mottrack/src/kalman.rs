//! Linear Kalman filter used for bounding box state estimation

use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};

/// Initial filter configuration
#[derive(Debug, Clone)]
pub struct KalmanFilterParams {
    pub dim_x: usize,    // State dimension
    pub dim_z: usize,    // Observation dimension
    pub x: DVector<f32>, // Initial state
    pub p: DMatrix<f32>, // Initial state covariance
    pub f: DMatrix<f32>, // State transition matrix
    pub h: DMatrix<f32>, // Observation matrix
    pub r: DMatrix<f32>, // Observation noise covariance
    pub q: DMatrix<f32>, // Process noise covariance
}

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    dim_x: usize,
    pub x: DVector<f32>,
    pub p: DMatrix<f32>,
    f: DMatrix<f32>,
    h: DMatrix<f32>,
    r: DMatrix<f32>,
    q: DMatrix<f32>,
}

impl KalmanFilter {
    pub fn new(params: KalmanFilterParams) -> Self {
        debug_assert_eq!(params.x.len(), params.dim_x);
        debug_assert_eq!(params.h.nrows(), params.dim_z);

        Self {
            dim_x: params.dim_x,
            x: params.x,
            p: params.p,
            f: params.f,
            h: params.h,
            r: params.r,
            q: params.q,
        }
    }

    /// Advance the state one step: x = F·x, P = F·P·Fᵀ + Q
    pub fn predict(&mut self) {
        self.x = &self.f * &self.x;
        self.p = &self.f * &self.p * self.f.transpose() + &self.q;
    }

    /// Fold in an observation
    pub fn update(&mut self, z: DVector<f32>) -> Result<()> {
        // Residual and innovation covariance
        let y = z - &self.h * &self.x;
        let s = &self.h * &self.p * self.h.transpose() + &self.r;

        let s_inv = s
            .try_inverse()
            .ok_or_else(|| anyhow!("innovation covariance is singular"))?;
        let k = &self.p * self.h.transpose() * s_inv;

        self.x = &self.x + &k * y;
        let i = DMatrix::identity(self.dim_x, self.dim_x);
        self.p = (i - k * &self.h) * &self.p;

        Ok(())
    }

    pub fn state(&self) -> &DVector<f32> {
        &self.x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_kalman_filter_basic() {
        // 1D position + velocity, observing position only
        let params = KalmanFilterParams {
            dim_x: 2,
            dim_z: 1,
            x: DVector::from_vec(vec![0.0, 1.0]),
            p: DMatrix::from_diagonal(&DVector::from_vec(vec![1000.0, 1000.0])),
            f: DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            h: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            r: DMatrix::from_element(1, 1, 0.1),
            q: DMatrix::from_diagonal(&DVector::from_vec(vec![0.01, 0.01])),
        };

        let mut kf = KalmanFilter::new(params);

        kf.predict();
        assert_abs_diff_eq!(kf.x[0], 1.0, epsilon = 0.001);

        kf.update(DVector::from_vec(vec![0.9])).unwrap();

        // State lands between prediction and measurement
        assert!(kf.x[0] > 0.8 && kf.x[0] < 1.0);
    }

    #[test]
    fn test_prediction_converges_to_measurements() {
        let params = KalmanFilterParams {
            dim_x: 2,
            dim_z: 1,
            x: DVector::from_vec(vec![0.0, 0.0]),
            p: DMatrix::from_diagonal(&DVector::from_vec(vec![100.0, 100.0])),
            f: DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            h: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            r: DMatrix::from_element(1, 1, 0.5),
            q: DMatrix::from_diagonal(&DVector::from_vec(vec![0.01, 0.01])),
        };
        let mut kf = KalmanFilter::new(params);

        // Object moving +2 per step; after enough updates the velocity
        // estimate should approach 2.
        for step in 1..=20 {
            kf.predict();
            kf.update(DVector::from_vec(vec![2.0 * step as f32])).unwrap();
        }
        assert_abs_diff_eq!(kf.x[1], 2.0, epsilon = 0.2);
    }
}
