//! Per-camera frame cache keyed by timestamp
//!
//! The tracker's capture consumer parks raw frames here; the detection
//! consumer later drains the window between two detection timestamps to
//! predict through undetected frames.

use crate::envelope::FrameEnvelope;
use std::collections::{BTreeMap, HashMap};

const DEFAULT_MAX_FRAMES: usize = 1000;

/// Timestamps are keyed at microsecond resolution so they order exactly
fn ts_key(timestamp: f64) -> i64 {
    (timestamp * 1_000_000.0) as i64
}

#[derive(Default)]
struct CameraFrames {
    frames: BTreeMap<i64, FrameEnvelope>,
}

pub struct FrameCache {
    cameras: HashMap<String, CameraFrames>,
    max_frames: usize,
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAMES)
    }
}

impl FrameCache {
    pub fn new(max_frames: usize) -> Self {
        Self {
            cameras: HashMap::new(),
            max_frames,
        }
    }

    /// Returns true when the camera was new to the cache
    pub fn add_camera(&mut self, camera_id: &str) -> bool {
        if self.cameras.contains_key(camera_id) {
            false
        } else {
            self.cameras.insert(camera_id.to_string(), CameraFrames::default());
            true
        }
    }

    /// Store a frame; the oldest entry is evicted past the size bound
    pub fn add_frame(&mut self, envelope: FrameEnvelope) {
        let camera = self
            .cameras
            .entry(envelope.camera_id.clone())
            .or_default();
        camera.frames.insert(ts_key(envelope.frame_timestamp), envelope);

        if self.max_frames > 0 && camera.frames.len() > self.max_frames {
            camera.frames.pop_first();
        }
    }

    /// Remove every frame of `camera_id` with timestamp below `to_ts` and
    /// return the ones strictly inside `(from_ts, to_ts)`. Frames at or
    /// before `from_ts` are dropped outright; they were already covered.
    pub fn take_between(
        &mut self,
        camera_id: &str,
        from_ts: f64,
        to_ts: f64,
    ) -> Vec<FrameEnvelope> {
        let Some(camera) = self.cameras.get_mut(camera_id) else {
            return Vec::new();
        };

        let upper = ts_key(to_ts);
        let mut split = camera.frames.split_off(&upper);
        std::mem::swap(&mut camera.frames, &mut split);
        // `split` now holds everything below to_ts

        let lower = ts_key(from_ts);
        split
            .into_iter()
            .filter(|(key, _)| *key > lower)
            .map(|(_, envelope)| envelope)
            .collect()
    }

    pub fn len(&self, camera_id: &str) -> usize {
        self.cameras
            .get(camera_id)
            .map_or(0, |camera| camera.frames.len())
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.values().all(|camera| camera.frames.is_empty())
    }
}
