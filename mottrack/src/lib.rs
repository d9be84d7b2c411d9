//! IoU-based multi-object tracking kernel
//!
//! Pure tracking primitives used by the MCMOT pipeline stages: bounding box
//! geometry, a constant-velocity Kalman filter over box state, Hungarian
//! detection-to-track assignment, and a multi-object tracker with a
//! tentative/confirmed/deleted track lifecycle.
//!
//! The kernel is broker- and I/O-free by design; the pipeline crate feeds it
//! decoded detections and consumes plain track records.
//!
//! ```rust,ignore
//! use mottrack::{InputDetection, MultiObjectTracker, TrackerConfig};
//!
//! let mut tracker = MultiObjectTracker::new(TrackerConfig::default());
//! let tracks = tracker.update(&detections, false)?;
//! ```

pub mod bbox;
pub mod hungarian;
pub mod kalman;
pub mod track;
pub mod tracker;

pub use bbox::{calculate_iou, iou_matrix, nms_keep, Bbox};
pub use hungarian::{AssignmentResult, HungarianSolver};
pub use kalman::{KalmanFilter, KalmanFilterParams};
pub use track::{Track, TrackState};
pub use tracker::{InputDetection, MultiObjectTracker, TrackOutput, TrackerConfig};
