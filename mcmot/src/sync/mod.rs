//! Frame synchronization engine
//!
//! Two concerns share this module: the *intra-camera* admission decision
//! (skip stale frames, wait for early ones, accept the rest) and the
//! *inter-camera* group former that aligns contemporaneous frames from all
//! cameras onto a shared sync key.
//!
//! Keys come in two flavors selected by [`SyncType`]: the raw frame number,
//! or a timestamp bucket of width `1/fps`. All engine state sits behind one
//! mutex per instance; group callbacks always run outside it.

mod cache;
mod core;
mod sequencing;

pub use cache::FrameCache;
pub use sequencing::Sequencer;

use crate::envelope::FrameEnvelope;
use crate::error::{PipelineError, Result};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Which envelope attribute aligns frames across cameras
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    Number,
    Timestamp,
}

/// Validated engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` disables synchronization entirely
    pub sync_type: Option<SyncType>,
    /// 0 means "adopt the fps declared by the first envelope"
    pub fps: u32,
    /// Buffered group count above which the oldest groups are evicted;
    /// 0 disables the bound
    pub backlog_threshold: usize,
    /// Seconds between backlog/synchronization sweeps; 0 disables them
    pub backlog_check_interval: f64,
    /// Seconds an unsettled group may sit in the buffer
    pub retention_time: f64,
    /// Maximum acceptable lateness before a frame is dropped to catch up
    pub latency_threshold: f64,
    /// Warm up by seeking past the backlog on the first delivery
    pub ignore_initial_delay: bool,
    /// Reorder per-camera arrivals into key order before processing
    pub enable_sequencing: bool,
    /// Always chase the newest offset, abandoning anything in flight
    pub seek_to_end: bool,
    /// Form cross-camera groups instead of per-frame admission
    pub unify: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_type: None,
            fps: 0,
            backlog_threshold: 0,
            backlog_check_interval: 1.0,
            retention_time: 60.0,
            latency_threshold: 60.0,
            ignore_initial_delay: false,
            enable_sequencing: false,
            seek_to_end: false,
            unify: false,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retention_time <= 0.0 {
            return Err(PipelineError::config(format!(
                "retention-time must be greater than 0, got {}",
                self.retention_time
            )));
        }
        if self.latency_threshold < 0.0 || self.backlog_check_interval < 0.0 {
            return Err(PipelineError::config(
                "latency-threshold and backlog-check-interval must not be negative",
            ));
        }
        if self.ignore_initial_delay
            && self.backlog_threshold == 0
            && self.backlog_check_interval <= 0.0
        {
            return Err(PipelineError::config(
                "ignore-initial-delay requires backlog-threshold or backlog-check-interval",
            ));
        }
        Ok(())
    }
}

/// Intra-camera admission verdict
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncDecision {
    /// Process the frame and advance the watermark
    Accept,
    /// Drop the frame: duplicate, out of order, or too stale to chase
    Skip,
    /// The upstream is ahead of schedule; hold for this long
    Wait(Duration),
}

/// A cross-camera group handed to the unify callback
#[derive(Debug, Clone)]
pub struct SyncGroup {
    pub sync_key: i64,
    /// False when the group was forced out by retention or backlog pressure
    pub complete: bool,
    /// Member frames, ordered by camera id
    pub frames: Vec<FrameEnvelope>,
}

/// Last accepted frame per camera
#[derive(Debug, Clone, Copy)]
pub struct Watermark {
    pub sync_key: i64,
    pub frame_number: u64,
    pub frame_timestamp: f64,
    pub wall_clock_arrival: f64,
}

/// The skip/wait policy as a pure function of watermark, incoming key and
/// wall clock. Identical inputs always yield identical outputs.
pub fn decide(
    watermark: Option<&Watermark>,
    sync_key: i64,
    frame_interval: f64,
    tolerance: f64,
    latency_threshold: f64,
    now: f64,
) -> SyncDecision {
    let Some(watermark) = watermark else {
        return SyncDecision::Accept;
    };

    if sync_key <= watermark.sync_key {
        return SyncDecision::Skip;
    }

    let expected = watermark.wall_clock_arrival
        + (sync_key - watermark.sync_key) as f64 * frame_interval;

    if now - expected > latency_threshold {
        return SyncDecision::Skip;
    }
    if now < expected - tolerance {
        return SyncDecision::Wait(Duration::from_secs_f64(expected - now));
    }
    SyncDecision::Accept
}

/// Wall clock in seconds since epoch, matching envelope timestamps
pub fn wall_clock_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Thread-safe frame synchronizer
pub struct FrameSync {
    core: Mutex<core::SyncCore>,
    config: SyncConfig,
}

impl FrameSync {
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let sync_type = config.sync_type.ok_or_else(|| {
            PipelineError::config("frame sync instantiated without a sync type")
        })?;
        log::info!("initialized frame sync with type {:?}", sync_type);
        Ok(Self {
            core: Mutex::new(core::SyncCore::new(sync_type, &config)),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Deposit a frame into the inter-camera buffer
    pub fn collect(&self, envelope: &FrameEnvelope) {
        self.collect_at(envelope, wall_clock_now());
    }

    pub fn collect_at(&self, envelope: &FrameEnvelope, now: f64) {
        let mut core = self.lock();
        core.collect(envelope, now);
    }

    /// Intra-camera admission for the given frame
    pub fn skip_or_wait(
        &self,
        camera_id: &str,
        frame_number: u64,
        frame_timestamp: f64,
        fps: u32,
    ) -> SyncDecision {
        self.skip_or_wait_at(camera_id, frame_number, frame_timestamp, fps, wall_clock_now())
    }

    /// Admission with an injected clock; `skip_or_wait` with the real one
    pub fn skip_or_wait_at(
        &self,
        camera_id: &str,
        frame_number: u64,
        frame_timestamp: f64,
        fps: u32,
        now: f64,
    ) -> SyncDecision {
        let mut core = self.lock();
        core.skip_or_wait(camera_id, frame_number, frame_timestamp, fps, now)
    }

    /// Drain every group that is complete, expired, or squeezed out by the
    /// backlog bound. The callback runs outside the engine lock.
    pub fn synchronize<F: FnMut(SyncGroup)>(&self, callback: F) {
        self.synchronize_at(wall_clock_now(), callback)
    }

    pub fn synchronize_at<F: FnMut(SyncGroup)>(&self, now: f64, mut callback: F) {
        let ready = {
            let mut core = self.lock();
            core.take_ready(now)
        };
        for group in ready {
            callback(group);
        }
    }

    /// Buffered group count
    pub fn backlog(&self) -> usize {
        self.lock().backlog()
    }

    /// Cameras observed in the current epoch
    pub fn cameras(&self) -> Vec<String> {
        self.lock().cameras()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, core::SyncCore> {
        // A poisoned sync mutex means a callback-side panic already aborted
        // the worker's useful life; the buffer state itself is still sound.
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watermark(key: i64, arrival: f64) -> Watermark {
        Watermark {
            sync_key: key,
            frame_number: key as u64,
            frame_timestamp: arrival,
            wall_clock_arrival: arrival,
        }
    }

    #[test]
    fn test_first_frame_is_accepted() {
        assert_eq!(decide(None, 5, 1.0 / 30.0, 1.0 / 30.0, 2.0, 100.0), SyncDecision::Accept);
    }

    #[test]
    fn test_old_key_is_skipped() {
        // Watermark at frame 100; frame 95 is out of order
        let wm = watermark(100, 3.33);
        assert_eq!(
            decide(Some(&wm), 95, 1.0 / 30.0, 1.0 / 30.0, 2.0, 3.40),
            SyncDecision::Skip
        );
    }

    #[test]
    fn test_on_time_frame_is_accepted() {
        let interval = 1.0 / 30.0;
        let wm = watermark(100, 3.33);
        // Frame 101 arriving exactly when expected
        assert_eq!(
            decide(Some(&wm), 101, interval, interval, 2.0, 3.33 + interval),
            SyncDecision::Accept
        );
    }

    #[test]
    fn test_stale_frame_is_skipped() {
        let interval = 1.0 / 30.0;
        let latency_threshold = 2.0;
        let wm = watermark(100, 3.33);
        let expected = 3.33 + interval;
        assert_eq!(
            decide(
                Some(&wm),
                101,
                interval,
                interval,
                latency_threshold,
                expected + 2.0 * latency_threshold
            ),
            SyncDecision::Skip
        );
    }

    #[test]
    fn test_early_frame_waits() {
        let interval = 1.0 / 30.0;
        let wm = watermark(100, 3.33);
        // Frame 110 showing up now, ten intervals early
        let decision = decide(Some(&wm), 110, interval, interval, 2.0, 3.33);
        match decision {
            SyncDecision::Wait(d) => {
                assert!((d.as_secs_f64() - 10.0 * interval).abs() < 1e-6);
            }
            other => panic!("expected Wait, got {other:?}"),
        }
    }

    #[test]
    fn test_decision_is_deterministic() {
        let wm = watermark(10, 50.0);
        let a = decide(Some(&wm), 12, 0.1, 0.1, 1.0, 50.15);
        let b = decide(Some(&wm), 12, 0.1, 0.1, 1.0, 50.15);
        assert_eq!(a, b);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_ok());

        config.retention_time = 0.0;
        assert!(config.validate().is_err());

        config.retention_time = 10.0;
        config.ignore_initial_delay = true;
        config.backlog_check_interval = 0.0;
        assert!(config.validate().is_err());

        config.backlog_threshold = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_sync_requires_type() {
        let config = SyncConfig::default();
        assert!(FrameSync::new(config).is_err());
    }
}
