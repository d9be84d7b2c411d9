//! Tracker stage: IoU + Kalman association over the detection stream
//!
//! Two consumer loops share one worker: the detection loop (primary) runs
//! the per-camera trackers, the capture loop (secondary) caches raw frames
//! so the tracker can predict through frames the detector never saw. The
//! loops share the frame cache behind a mutex; `ignore-capture` disables
//! the secondary loop and with it all Kalman-on-capture prediction.

use crate::config::{
    group_id, stage_topic, StageConfig, TrackerModuleConfig, STAGE_CAPTURE, STAGE_TRACKER,
};
use crate::envelope::{FrameEnvelope, TrackRecord};
use crate::error::Result;
use crate::messaging::{ConsumerSettings, MessageProducer};
use crate::prediction::PredictionGate;
use crate::runtime::{FrameHandler, Outbound, ShutdownToken, StageRuntime};
use crate::sync::FrameCache;
use mottrack::{Bbox, InputDetection, MultiObjectTracker, TrackerConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn kernel_config(module: &TrackerModuleConfig) -> TrackerConfig {
    TrackerConfig {
        max_age: module.max_age,
        n_init: module.n_init,
        max_iou_distance: module.max_iou_distance,
        nms_max_overlap: module.nms_max_overlap,
        init_score_threshold: module.detection_score_threshold,
        ..TrackerConfig::default()
    }
}

/// Secondary loop: park raw capture frames for later prediction
pub struct TrackerCaptureHandler {
    cache: Arc<Mutex<FrameCache>>,
}

impl TrackerCaptureHandler {
    pub fn new(cache: Arc<Mutex<FrameCache>>) -> Self {
        Self { cache }
    }
}

impl FrameHandler for TrackerCaptureHandler {
    fn on_frame(&mut self, envelope: FrameEnvelope) -> Result<Vec<Outbound>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.add_camera(&envelope.camera_id);
        cache.add_frame(envelope);
        Ok(Vec::new())
    }
}

/// Primary loop: associate detections to tracks, predict through gaps
pub struct TrackerDetectionHandler {
    outbound_topic: String,
    cache: Arc<Mutex<FrameCache>>,
    kernel: TrackerConfig,
    trackers: HashMap<String, MultiObjectTracker>,
    gate: PredictionGate,
    last_detection_ts: HashMap<String, f64>,
    detection_score_threshold: f32,
    only_confirmed_tracks: bool,
    ignore_capture: bool,
}

impl TrackerDetectionHandler {
    pub fn new(
        module: &TrackerModuleConfig,
        cache: Arc<Mutex<FrameCache>>,
        outbound_topic: String,
    ) -> Self {
        Self {
            outbound_topic,
            cache,
            kernel: kernel_config(module),
            trackers: HashMap::new(),
            gate: PredictionGate::new(module.prediction_factor),
            last_detection_ts: HashMap::new(),
            detection_score_threshold: module.detection_score_threshold,
            only_confirmed_tracks: module.only_confirmed_tracks,
            ignore_capture: module.ignore_capture,
        }
    }

    fn tracker(&mut self, camera_id: &str) -> &mut MultiObjectTracker {
        let kernel = self.kernel.clone();
        self.trackers
            .entry(camera_id.to_string())
            .or_insert_with(|| MultiObjectTracker::new(kernel))
    }

    /// Predict through capture frames that never hit the detection stream,
    /// bounded by the prediction-factor gate.
    fn predict_cached_frames(&mut self, camera_id: &str, up_to_ts: f64) -> Vec<Outbound> {
        let from_ts = self.last_detection_ts.get(camera_id).copied().unwrap_or(0.0);
        let undetected = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.take_between(camera_id, from_ts, up_to_ts)
        };

        let mut outs = Vec::new();
        for mut old_frame in undetected {
            self.gate.record_observed(camera_id);
            if !self.gate.allow(camera_id) {
                continue;
            }

            let tracks = self.tracker(camera_id).predict_only();
            if tracks.is_empty() {
                continue;
            }
            self.gate.record_predicted(camera_id);

            let records: Vec<TrackRecord> = tracks
                .into_iter()
                .filter(|t| t.bbox.is_valid())
                .map(|t| TrackRecord {
                    bbox: t.bbox.to_xywh(),
                    track_id: t.track_id.to_string(),
                    class_id: t.label,
                    confirmed: t.confirmed,
                })
                .collect();

            log::debug!(
                "{} {camera_id} (c) {}",
                old_frame.frame_number,
                records.len()
            );
            old_frame.metadata.tracks = Some(records);
            old_frame.metadata.predicted = Some(true);
            outs.push(Outbound::keyed(self.outbound_topic.clone(), old_frame));
        }
        outs
    }
}

impl FrameHandler for TrackerDetectionHandler {
    fn on_frame(&mut self, mut envelope: FrameEnvelope) -> Result<Vec<Outbound>> {
        let camera_id = envelope.camera_id.clone();
        self.gate.record_observed(&camera_id);

        let detections = envelope.metadata.detections.clone().unwrap_or_default();
        let threshold = self.detection_score_threshold;
        let inputs: Vec<InputDetection> = detections
            .iter()
            .filter(|d| d.score > threshold)
            .map(|d| InputDetection {
                bbox: Bbox::from_xywh(d.bbox),
                score: d.score,
                label: d.class_id.clone(),
            })
            .collect();

        let only_confirmed = self.only_confirmed_tracks;
        let tracks = self.tracker(&camera_id).update(&inputs, only_confirmed)?;

        let records: Vec<TrackRecord> = tracks
            .into_iter()
            .filter(|t| t.bbox.is_valid())
            .map(|t| TrackRecord {
                bbox: t.bbox.to_xywh(),
                track_id: t.track_id.to_string(),
                class_id: t.label,
                confirmed: t.confirmed,
            })
            .collect();

        log::debug!("{} {camera_id} (d) {}", envelope.frame_number, records.len());

        let frame_timestamp = envelope.frame_timestamp;
        envelope.metadata.tracks = Some(records);
        let mut outs = vec![Outbound::keyed(self.outbound_topic.clone(), envelope)];

        if !self.ignore_capture {
            outs.extend(self.predict_cached_frames(&camera_id, frame_timestamp));
        }
        self.last_detection_ts.insert(camera_id, frame_timestamp);

        Ok(outs)
    }
}

/// Run the tracker worker: the detection loop on this thread, the capture
/// loop (unless disabled) on a second one.
pub fn run(config: &StageConfig, shutdown: ShutdownToken) -> Result<()> {
    let module: TrackerModuleConfig = config.module()?;
    let cache = Arc::new(Mutex::new(FrameCache::default()));
    let producer = Arc::new(MessageProducer::new(&config.bootstrap_servers)?);
    let outbound_topic = stage_topic(STAGE_TRACKER, &config.pipeline);

    let capture_thread = if module.ignore_capture {
        None
    } else {
        let mut settings = ConsumerSettings::new(
            stage_topic(STAGE_CAPTURE, &config.pipeline),
            group_id(&config.pipeline, STAGE_TRACKER, "capture"),
        );
        settings.key_filter = module.camera_id.clone();

        let mut runtime = StageRuntime::new(
            STAGE_TRACKER,
            &config.pipeline,
            &config.bootstrap_servers,
            settings,
            Arc::clone(&producer),
            None,
            shutdown.clone(),
        )?;
        let mut handler = TrackerCaptureHandler::new(Arc::clone(&cache));

        Some(std::thread::spawn(move || {
            if let Err(e) = runtime.run_frames(&mut handler) {
                log::error!("tracker capture loop failed: {e}");
            }
        }))
    };

    let mut settings = ConsumerSettings::new(
        stage_topic(&module.detection_module, &config.pipeline),
        group_id(&config.pipeline, STAGE_TRACKER, "detection"),
    );
    settings.key_filter = module.camera_id.clone();

    let mut runtime = StageRuntime::new(
        STAGE_TRACKER,
        &config.pipeline,
        &config.bootstrap_servers,
        settings,
        producer,
        config.sync_config()?,
        shutdown,
    )?;
    let mut handler = TrackerDetectionHandler::new(&module, cache, outbound_topic);
    let result = runtime.run_frames(&mut handler);

    if let Some(thread) = capture_thread {
        let _ = thread.join();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CameraMetadata, Detection, FrameMetadata, ImagePayload};

    fn module(prediction_factor: f32, only_confirmed: bool) -> TrackerModuleConfig {
        serde_json::from_value(serde_json::json!({
            "max-iou-distance": 0.7,
            "max-age": 10,
            "n-init": 1,
            "detection-score-threshold": 0.5,
            "prediction-factor": prediction_factor,
            "only-confirmed-tracks": only_confirmed,
        }))
        .unwrap()
    }

    fn envelope(camera: &str, frame_number: u64, ts: f64, detections: Vec<Detection>) -> FrameEnvelope {
        FrameEnvelope {
            camera_id: camera.to_string(),
            frame_number,
            frame_timestamp: ts,
            fps: 30,
            image: ImagePayload::default(),
            metadata: FrameMetadata {
                detections: Some(detections),
                ..FrameMetadata::default()
            },
            camera_metadata: CameraMetadata::default(),
        }
    }

    fn det(x: f32, score: f32) -> Detection {
        Detection {
            bbox: [x, 10.0, 40.0, 40.0],
            score,
            class_id: "person".to_string(),
            reid_id: None,
            predicted: None,
        }
    }

    #[test]
    fn test_tracks_appended_with_stable_ids() {
        let cache = Arc::new(Mutex::new(FrameCache::default()));
        let mut handler =
            TrackerDetectionHandler::new(&module(0.0, false), cache, "tracker-demo-topic".into());

        let out1 = handler
            .on_frame(envelope("cam-1", 1, 1.0, vec![det(10.0, 0.9)]))
            .unwrap();
        let out2 = handler
            .on_frame(envelope("cam-1", 2, 1.033, vec![det(12.0, 0.9)]))
            .unwrap();

        let t1 = out1[0].envelope.metadata.tracks.as_ref().unwrap();
        let t2 = out2[0].envelope.metadata.tracks.as_ref().unwrap();
        assert_eq!(t1.len(), 1);
        assert_eq!(t2.len(), 1);
        assert_eq!(t1[0].track_id, t2[0].track_id);
    }

    #[test]
    fn test_low_score_detections_ignored() {
        let cache = Arc::new(Mutex::new(FrameCache::default()));
        let mut handler =
            TrackerDetectionHandler::new(&module(0.0, false), cache, "tracker-demo-topic".into());

        let out = handler
            .on_frame(envelope("cam-1", 1, 1.0, vec![det(10.0, 0.2)]))
            .unwrap();
        assert!(out[0].envelope.metadata.tracks.as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_cached_captures_yield_predicted_frames() {
        let cache = Arc::new(Mutex::new(FrameCache::default()));
        let mut capture_handler = TrackerCaptureHandler::new(Arc::clone(&cache));
        let mut handler = TrackerDetectionHandler::new(
            &module(1.0, false),
            Arc::clone(&cache),
            "tracker-demo-topic".into(),
        );

        // Detection at t=1 establishes a track
        handler
            .on_frame(envelope("cam-1", 1, 1.0, vec![det(10.0, 0.9)]))
            .unwrap();
        handler
            .on_frame(envelope("cam-1", 2, 1.033, vec![det(12.0, 0.9)]))
            .unwrap();

        // Two raw captures arrive between detections
        capture_handler
            .on_frame(envelope("cam-1", 3, 1.05, vec![]))
            .unwrap();
        capture_handler
            .on_frame(envelope("cam-1", 4, 1.08, vec![]))
            .unwrap();

        // Next detection drains the cached window
        let outs = handler
            .on_frame(envelope("cam-1", 5, 1.1, vec![det(14.0, 0.9)]))
            .unwrap();

        assert_eq!(outs.len(), 3);
        let predicted: Vec<_> = outs
            .iter()
            .filter(|o| o.envelope.metadata.predicted == Some(true))
            .collect();
        assert_eq!(predicted.len(), 2);
        for out in predicted {
            assert!(!out.envelope.metadata.tracks.as_ref().unwrap().is_empty());
        }
    }

    #[test]
    fn test_zero_prediction_factor_never_predicts() {
        let cache = Arc::new(Mutex::new(FrameCache::default()));
        let mut capture_handler = TrackerCaptureHandler::new(Arc::clone(&cache));
        let mut handler = TrackerDetectionHandler::new(
            &module(0.0, false),
            Arc::clone(&cache),
            "tracker-demo-topic".into(),
        );

        handler
            .on_frame(envelope("cam-1", 1, 1.0, vec![det(10.0, 0.9)]))
            .unwrap();
        capture_handler
            .on_frame(envelope("cam-1", 2, 1.05, vec![]))
            .unwrap();
        let outs = handler
            .on_frame(envelope("cam-1", 3, 1.1, vec![det(12.0, 0.9)]))
            .unwrap();
        assert_eq!(outs.len(), 1);
    }

    #[test]
    fn test_only_confirmed_filters_fresh_tracks() {
        let cache = Arc::new(Mutex::new(FrameCache::default()));
        let mut module = module(0.0, true);
        module.n_init = 3;
        let mut handler =
            TrackerDetectionHandler::new(&module, cache, "tracker-demo-topic".into());

        let out = handler
            .on_frame(envelope("cam-1", 1, 1.0, vec![det(10.0, 0.9)]))
            .unwrap();
        // A brand-new track is tentative and filtered
        assert!(out[0].envelope.metadata.tracks.as_ref().unwrap().is_empty());
    }
}
