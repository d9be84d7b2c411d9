//! Shared synchronizer state: per-camera watermarks and the group buffer

use super::{decide, SyncConfig, SyncDecision, SyncGroup, SyncType, Watermark};
use crate::envelope::FrameEnvelope;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One sync-key slot holding at most one frame per camera
struct GroupEntry {
    frames: BTreeMap<String, FrameEnvelope>,
    entry_time: f64,
}

pub(super) struct SyncCore {
    mode: SyncType,
    fps: u32,
    backlog_threshold: usize,
    retention_time: f64,
    latency_threshold: f64,
    unify: bool,
    watermarks: HashMap<String, Watermark>,
    buffer: BTreeMap<i64, GroupEntry>,
    /// Cameras seen since the engine came up (the epoch)
    cameras: BTreeSet<String>,
    global_watermark: Option<i64>,
}

impl SyncCore {
    pub(super) fn new(mode: SyncType, config: &SyncConfig) -> Self {
        Self {
            mode,
            fps: config.fps,
            backlog_threshold: config.backlog_threshold,
            retention_time: config.retention_time,
            latency_threshold: config.latency_threshold,
            unify: config.unify,
            watermarks: HashMap::new(),
            buffer: BTreeMap::new(),
            cameras: BTreeSet::new(),
            global_watermark: None,
        }
    }

    /// Adopt the stream's declared rate when the config left fps at 0
    fn ensure_fps(&mut self, fps: u32) {
        if self.fps == 0 && fps > 0 {
            self.fps = fps;
            log::debug!("frame sync fps adopted from stream: {}", fps);
        }
    }

    /// Seconds spanned by one sync key
    fn frame_interval(&self) -> f64 {
        if self.fps == 0 {
            0.0
        } else {
            1.0 / self.fps as f64
        }
    }

    fn sync_key(&self, frame_number: u64, frame_timestamp: f64) -> i64 {
        match self.mode {
            SyncType::Number => frame_number as i64,
            SyncType::Timestamp => {
                let tol = self.frame_interval();
                if tol <= 0.0 {
                    frame_number as i64
                } else {
                    (frame_timestamp / tol).floor() as i64
                }
            }
        }
    }

    pub(super) fn skip_or_wait(
        &mut self,
        camera_id: &str,
        frame_number: u64,
        frame_timestamp: f64,
        fps: u32,
        now: f64,
    ) -> SyncDecision {
        self.ensure_fps(fps);
        let interval = self.frame_interval();
        if interval <= 0.0 {
            // No rate to pace against
            return SyncDecision::Accept;
        }

        let key = self.sync_key(frame_number, frame_timestamp);
        let decision = decide(
            self.watermarks.get(camera_id),
            key,
            interval,
            interval,
            self.latency_threshold,
            now,
        );

        match decision {
            SyncDecision::Accept => {
                self.watermarks.insert(
                    camera_id.to_string(),
                    Watermark {
                        sync_key: key,
                        frame_number,
                        frame_timestamp,
                        wall_clock_arrival: now,
                    },
                );
            }
            SyncDecision::Skip => {
                log::debug!(
                    "camera {camera_id}: skipping frame {frame_number} (key {key})"
                );
            }
            SyncDecision::Wait(d) => {
                log::debug!(
                    "camera {camera_id}: frame {frame_number} early by {:.3}s",
                    d.as_secs_f64()
                );
            }
        }
        decision
    }

    pub(super) fn collect(&mut self, envelope: &FrameEnvelope, now: f64) {
        self.ensure_fps(envelope.fps);
        let key = self.sync_key(envelope.frame_number, envelope.frame_timestamp);

        if let Some(gw) = self.global_watermark {
            if key <= gw {
                log::debug!(
                    "camera {}: frame {} at key {key} behind group watermark {gw}, dropped",
                    envelope.camera_id,
                    envelope.frame_number
                );
                return;
            }
        }

        self.cameras.insert(envelope.camera_id.clone());

        let entry = self.buffer.entry(key).or_insert_with(|| GroupEntry {
            frames: BTreeMap::new(),
            entry_time: now,
        });
        // Keep the first frame a camera lands in a slot
        entry
            .frames
            .entry(envelope.camera_id.clone())
            .or_insert_with(|| envelope.clone());
        log::debug!(
            "collected frame: camera={} frame={} key={key} buffered={}",
            envelope.camera_id,
            envelope.frame_number,
            self.buffer.len()
        );
    }

    /// Pull every group ready for emission: complete groups first, then
    /// retention expiries, then backlog-pressure evictions.
    pub(super) fn take_ready(&mut self, now: f64) -> Vec<SyncGroup> {
        let mut ready = Vec::new();
        let expected = self.cameras.len();

        // Complete groups advance the global watermark
        if expected > 0 {
            let complete_keys: Vec<i64> = self
                .buffer
                .iter()
                .filter(|(_, e)| e.frames.len() == expected)
                .map(|(k, _)| *k)
                .collect();

            for key in complete_keys {
                if let Some(entry) = self.buffer.remove(&key) {
                    ready.push(self.make_group(key, true, entry));
                    self.global_watermark =
                        Some(self.global_watermark.map_or(key, |gw| gw.max(key)));
                }
            }
        }

        // Everything below the watermark can never complete
        if let Some(gw) = self.global_watermark {
            let stale: Vec<i64> = self.buffer.range(..gw).map(|(k, _)| *k).collect();
            for key in stale {
                self.buffer.remove(&key);
                log::debug!("discarded group at key {key} behind watermark {gw}");
            }
        }

        // Retention: unsettled groups past their wait are forced out
        let expired: Vec<i64> = self
            .buffer
            .iter()
            .filter(|(_, e)| now - e.entry_time > self.retention_time)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(entry) = self.buffer.remove(&key) {
                if self.unify {
                    log::info!(
                        "group at key {key} expired after {:.0}s with {}/{} cameras, emitting partial",
                        self.retention_time,
                        entry.frames.len(),
                        expected
                    );
                    ready.push(self.make_group(key, false, entry));
                } else {
                    log::debug!(
                        "group at key {key} expired after {:.0}s, discarded",
                        self.retention_time
                    );
                }
            }
        }

        // Backlog bound: squeeze the oldest groups out
        if self.backlog_threshold > 0 {
            while self.buffer.len() > self.backlog_threshold {
                let Some((&key, _)) = self.buffer.iter().next() else {
                    break;
                };
                if let Some(entry) = self.buffer.remove(&key) {
                    if self.unify {
                        log::warn!(
                            "backlog {} over threshold {}, discarding oldest group at key {key}",
                            self.buffer.len() + 1,
                            self.backlog_threshold
                        );
                    } else {
                        ready.push(self.make_group(key, false, entry));
                    }
                }
            }
        }

        ready.sort_by_key(|g| g.sync_key);
        ready
    }

    fn make_group(&self, sync_key: i64, complete: bool, entry: GroupEntry) -> SyncGroup {
        SyncGroup {
            sync_key,
            complete,
            // BTreeMap iteration gives camera-id order
            frames: entry.frames.into_values().collect(),
        }
    }

    pub(super) fn backlog(&self) -> usize {
        self.buffer.len()
    }

    pub(super) fn cameras(&self) -> Vec<String> {
        self.cameras.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CameraMetadata, FrameMetadata, ImagePayload};
    use crate::sync::FrameSync;

    fn envelope(camera: &str, frame_number: u64, ts: f64, fps: u32) -> FrameEnvelope {
        FrameEnvelope {
            camera_id: camera.to_string(),
            frame_number,
            frame_timestamp: ts,
            fps,
            image: ImagePayload::from_jpeg(&[1, 2, 3], 4, 4),
            metadata: FrameMetadata::default(),
            camera_metadata: CameraMetadata::default(),
        }
    }

    fn unify_sync(mode: SyncType, backlog_threshold: usize, retention: f64) -> FrameSync {
        FrameSync::new(SyncConfig {
            sync_type: Some(mode),
            fps: 30,
            backlog_threshold,
            backlog_check_interval: 1.0,
            retention_time: retention,
            latency_threshold: 5.0,
            unify: true,
            ..SyncConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_two_cameras_group_per_timestamp_bucket() {
        let sync = unify_sync(SyncType::Timestamp, 0, 60.0);

        // Camera A on the grid, camera B 5ms behind, both at 30 fps
        for i in 0..5u64 {
            let base = i as f64 / 30.0;
            sync.collect_at(&envelope("cam-a", i, base + 0.001, 30), base);
            sync.collect_at(&envelope("cam-b", i, base + 0.005, 30), base);
        }

        let mut groups = Vec::new();
        sync.synchronize_at(1.0, |g| groups.push(g));

        assert_eq!(groups.len(), 5);
        for (i, group) in groups.iter().enumerate() {
            assert_eq!(group.sync_key, i as i64);
            assert!(group.complete);
            assert_eq!(group.frames.len(), 2);
            assert_eq!(group.frames[0].camera_id, "cam-a");
            assert_eq!(group.frames[1].camera_id, "cam-b");
        }
        assert_eq!(sync.backlog(), 0);
    }

    #[test]
    fn test_number_mode_groups_on_frame_number() {
        let sync = unify_sync(SyncType::Number, 0, 60.0);

        sync.collect_at(&envelope("cam-a", 7, 100.0, 30), 100.0);
        sync.collect_at(&envelope("cam-b", 7, 100.4, 30), 100.4);

        let mut groups = Vec::new();
        sync.synchronize_at(101.0, |g| groups.push(g));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].sync_key, 7);
    }

    #[test]
    fn test_retention_emits_partial_groups() {
        // Camera B stops; after retention the A-only groups come out partial
        let sync = unify_sync(SyncType::Number, 0, 2.0);

        sync.collect_at(&envelope("cam-a", 0, 0.0, 30), 0.0);
        sync.collect_at(&envelope("cam-b", 0, 0.0, 30), 0.0);
        let mut groups = Vec::new();
        sync.synchronize_at(0.5, |g| groups.push(g));
        assert_eq!(groups.len(), 1);
        assert!(groups[0].complete);

        // B went silent at t=5
        sync.collect_at(&envelope("cam-a", 150, 5.0, 30), 5.0);
        sync.collect_at(&envelope("cam-a", 151, 5.03, 30), 5.03);

        let mut partials = Vec::new();
        sync.synchronize_at(6.0, |g| partials.push(g));
        assert!(partials.is_empty(), "not expired yet");

        sync.synchronize_at(7.1, |g| partials.push(g));
        assert_eq!(partials.len(), 2);
        for group in &partials {
            assert!(!group.complete);
            assert_eq!(group.frames.len(), 1);
            assert_eq!(group.frames[0].camera_id, "cam-a");
        }
        assert_eq!(sync.backlog(), 0);
    }

    #[test]
    fn test_backlog_overflow_discards_oldest_in_unify_mode() {
        let sync = unify_sync(SyncType::Number, 3, 600.0);

        // One camera races ahead while the other lags
        sync.collect_at(&envelope("cam-b", 0, 0.0, 30), 0.0);
        for i in 0..10u64 {
            sync.collect_at(&envelope("cam-a", i, i as f64 / 30.0, 30), 0.3);
        }

        let mut groups = Vec::new();
        sync.synchronize_at(0.5, |g| groups.push(g));

        // Key 0 completed (both cameras); the rest was squeezed to the bound
        assert_eq!(groups.len(), 1);
        assert!(groups[0].complete);
        assert!(sync.backlog() <= 3, "backlog {} over bound", sync.backlog());
    }

    #[test]
    fn test_watermark_discards_stragglers() {
        let sync = unify_sync(SyncType::Number, 0, 60.0);

        sync.collect_at(&envelope("cam-a", 5, 0.0, 30), 0.0);
        sync.collect_at(&envelope("cam-b", 5, 0.0, 30), 0.0);
        sync.synchronize_at(0.1, |_| {});

        // A frame behind the advanced watermark is refused at the door
        sync.collect_at(&envelope("cam-a", 3, 0.2, 30), 0.2);
        assert_eq!(sync.backlog(), 0);
    }

    #[test]
    fn test_buffer_empty_after_quiescence() {
        let sync = unify_sync(SyncType::Timestamp, 0, 2.0);
        sync.collect_at(&envelope("cam-a", 0, 0.0, 30), 0.0);
        sync.collect_at(&envelope("cam-b", 1, 10.0, 30), 10.0);

        sync.synchronize_at(20.0, |_| {});
        assert_eq!(sync.backlog(), 0);
    }

    #[test]
    fn test_duplicate_camera_frame_keeps_first() {
        let sync = unify_sync(SyncType::Number, 0, 60.0);
        let first = envelope("cam-a", 3, 1.0, 30);
        let mut second = envelope("cam-a", 3, 1.5, 30);
        second.metadata.predicted = Some(true);

        sync.collect_at(&first, 1.0);
        sync.collect_at(&second, 1.5);
        sync.collect_at(&envelope("cam-b", 3, 1.1, 30), 1.1);

        let mut groups = Vec::new();
        sync.synchronize_at(2.0, |g| groups.push(g));
        assert_eq!(groups.len(), 1);
        let cam_a = &groups[0].frames[0];
        assert_eq!(cam_a.frame_timestamp, 1.0);
        assert!(cam_a.metadata.predicted.is_none());
    }
}
