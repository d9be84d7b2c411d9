//! Per-camera reordering of out-of-order arrivals
//!
//! Partitioned consumption can interleave cameras arbitrarily and, with
//! relaxed producers, deliver a single camera's frames slightly out of
//! order. The sequencer parks arrivals in per-camera priority buffers and
//! releases them in ascending sync-key order on a fixed cadence.

use crate::envelope::FrameEnvelope;
use std::collections::{BTreeMap, HashMap};

pub struct Sequencer {
    /// Seconds between flushes
    interval: f64,
    last_flush: f64,
    /// camera id -> sync key -> envelope
    buffers: HashMap<String, BTreeMap<i64, FrameEnvelope>>,
    buffered: usize,
}

impl Sequencer {
    pub fn new(interval: f64, now: f64) -> Self {
        Self {
            interval,
            last_flush: now,
            buffers: HashMap::new(),
            buffered: 0,
        }
    }

    /// Park a frame under its sync key. A duplicate key for the same camera
    /// replaces the earlier arrival.
    pub fn collect(&mut self, sync_key: i64, envelope: FrameEnvelope) {
        let buffer = self.buffers.entry(envelope.camera_id.clone()).or_default();
        if buffer.insert(sync_key, envelope).is_none() {
            self.buffered += 1;
        }
        log::debug!("sequencer buffered frames: {}", self.buffered);
    }

    /// Whether the flush cadence has elapsed
    pub fn due(&self, now: f64) -> bool {
        self.interval > 0.0 && now - self.last_flush >= self.interval
    }

    /// Release everything buffered, globally ordered by sync key and then
    /// camera id so interleavings are deterministic.
    pub fn drain(&mut self, now: f64) -> Vec<FrameEnvelope> {
        self.last_flush = now;
        let mut ordered: Vec<(i64, FrameEnvelope)> = Vec::with_capacity(self.buffered);

        for buffer in self.buffers.values_mut() {
            while let Some((key, envelope)) = buffer.pop_first() {
                ordered.push((key, envelope));
            }
        }
        self.buffered = 0;

        ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.camera_id.cmp(&b.1.camera_id)));
        ordered.into_iter().map(|(_, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CameraMetadata, FrameMetadata, ImagePayload};

    fn envelope(camera: &str, frame_number: u64) -> FrameEnvelope {
        FrameEnvelope {
            camera_id: camera.to_string(),
            frame_number,
            frame_timestamp: frame_number as f64 / 30.0,
            fps: 30,
            image: ImagePayload::default(),
            metadata: FrameMetadata::default(),
            camera_metadata: CameraMetadata::default(),
        }
    }

    #[test]
    fn test_out_of_order_arrivals_come_out_sorted() {
        let mut seq = Sequencer::new(1.0, 0.0);
        seq.collect(3, envelope("cam-a", 3));
        seq.collect(1, envelope("cam-a", 1));
        seq.collect(2, envelope("cam-a", 2));

        assert!(!seq.due(0.5));
        assert!(seq.due(1.5));

        let drained = seq.drain(1.5);
        let numbers: Vec<u64> = drained.iter().map(|e| e.frame_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(seq.is_empty());
    }

    #[test]
    fn test_cameras_interleave_by_key() {
        let mut seq = Sequencer::new(1.0, 0.0);
        seq.collect(2, envelope("cam-b", 2));
        seq.collect(1, envelope("cam-a", 1));
        seq.collect(1, envelope("cam-b", 1));
        seq.collect(2, envelope("cam-a", 2));

        let drained = seq.drain(2.0);
        let order: Vec<(u64, String)> = drained
            .iter()
            .map(|e| (e.frame_number, e.camera_id.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                (1, "cam-a".to_string()),
                (1, "cam-b".to_string()),
                (2, "cam-a".to_string()),
                (2, "cam-b".to_string()),
            ]
        );
    }

    #[test]
    fn test_duplicate_key_replaces() {
        let mut seq = Sequencer::new(1.0, 0.0);
        seq.collect(1, envelope("cam-a", 1));
        let mut newer = envelope("cam-a", 1);
        newer.frame_timestamp = 99.0;
        seq.collect(1, newer);

        let drained = seq.drain(2.0);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].frame_timestamp, 99.0);
    }
}
