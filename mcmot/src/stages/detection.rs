//! Detection stage: object detector over the capture stream
//!
//! Filters detector output by confidence and class allowlist, appends the
//! detection records, and passes the image bytes through untouched. With
//! `predict` enabled, frames the sync layer skips still yield output: a
//! Kalman step over the camera's last known detections, flagged as
//! predicted.

use crate::config::{group_id, stage_topic, DetectionModuleConfig, StageConfig, STAGE_CAPTURE, STAGE_DETECTION};
use crate::detector::{class_name, Detector, OnnxDetector};
use crate::envelope::{Detection, FrameEnvelope};
use crate::error::Result;
use crate::messaging::{ConsumerSettings, MessageProducer};
use crate::prediction::PredictorBank;
use crate::runtime::{FrameHandler, Outbound, ShutdownToken, StageRuntime};
use std::sync::Arc;

pub struct DetectionHandler {
    detector: Box<dyn Detector>,
    outbound_topic: String,
    classes: Vec<String>,
    confidence_score: f32,
    predict: bool,
    bank: PredictorBank,
}

impl DetectionHandler {
    pub fn new(
        detector: Box<dyn Detector>,
        outbound_topic: String,
        module: &DetectionModuleConfig,
    ) -> Self {
        Self {
            detector,
            outbound_topic,
            classes: module.classes.clone(),
            confidence_score: module.confidence_score,
            predict: module.predict,
            bank: PredictorBank::new(),
        }
    }

    fn class_allowed(&self, name: &str) -> bool {
        self.classes.is_empty() || self.classes.iter().any(|c| c == name)
    }
}

impl FrameHandler for DetectionHandler {
    fn on_frame(&mut self, mut envelope: FrameEnvelope) -> Result<Vec<Outbound>> {
        let jpeg = envelope.image.to_bytes()?;
        let image = image::load_from_memory(&jpeg)?.to_rgb8();

        let detections: Vec<Detection> = self
            .detector
            .detect(&image)?
            .into_iter()
            .filter(|d| d.score >= self.confidence_score)
            .map(|d| Detection {
                bbox: d.bbox,
                score: d.score,
                class_id: class_name(d.class_id),
                reid_id: None,
                predicted: None,
            })
            .filter(|d| self.class_allowed(&d.class_id))
            .collect();

        log::debug!(
            "camera {}: frame {} produced {} detection(s)",
            envelope.camera_id,
            envelope.frame_number,
            detections.len()
        );

        if self.predict {
            self.bank.observe(&envelope.camera_id, &detections);
        }

        envelope.metadata.detections = Some(detections);
        Ok(vec![Outbound::keyed(self.outbound_topic.clone(), envelope)])
    }

    fn on_skipped(&mut self, mut envelope: FrameEnvelope) -> Result<Vec<Outbound>> {
        if !self.predict {
            return Ok(Vec::new());
        }

        let predicted = self.bank.predict(&envelope.camera_id);
        if predicted.is_empty() {
            return Ok(Vec::new());
        }

        log::debug!(
            "camera {}: frame {} skipped, emitting {} predicted box(es)",
            envelope.camera_id,
            envelope.frame_number,
            predicted.len()
        );

        envelope.metadata.detections = Some(predicted);
        envelope.metadata.predicted = Some(true);
        Ok(vec![Outbound::keyed(self.outbound_topic.clone(), envelope)])
    }
}

/// Run the detection worker from a parsed stage config
pub fn run(config: &StageConfig, shutdown: ShutdownToken) -> Result<()> {
    let module: DetectionModuleConfig = config.module()?;
    let detector = OnnxDetector::new(&module.model, module.confidence_score)?;

    let producer = Arc::new(MessageProducer::new(&config.bootstrap_servers)?);
    let mut runtime = StageRuntime::new(
        STAGE_DETECTION,
        &config.pipeline,
        &config.bootstrap_servers,
        ConsumerSettings::new(
            stage_topic(STAGE_CAPTURE, &config.pipeline),
            group_id(&config.pipeline, STAGE_DETECTION, "main"),
        ),
        producer,
        config.sync_config()?,
        shutdown,
    )?;

    let mut handler = DetectionHandler::new(
        Box::new(detector),
        stage_topic(STAGE_DETECTION, &config.pipeline),
        &module,
    );
    runtime.run_frames(&mut handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::RawDetection;
    use crate::envelope::{CameraMetadata, FrameMetadata, ImagePayload};

    /// Canned detector for exercising the handler without a model
    struct FixedDetector(Vec<RawDetection>);

    impl Detector for FixedDetector {
        fn detect(&mut self, _image: &image::RgbImage) -> Result<Vec<RawDetection>> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn jpeg_envelope() -> FrameEnvelope {
        // Encode a tiny image so the decode path runs for real
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([30, 60, 90]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        FrameEnvelope {
            camera_id: "cam-1".to_string(),
            frame_number: 1,
            frame_timestamp: 1.0,
            fps: 30,
            image: ImagePayload::from_jpeg(&jpeg, 8, 8),
            metadata: FrameMetadata::default(),
            camera_metadata: CameraMetadata::default(),
        }
    }

    fn module(classes: Vec<String>, predict: bool) -> DetectionModuleConfig {
        serde_json::from_value(serde_json::json!({
            "classes": classes,
            "confidence-score": 0.3,
            "predict": predict,
        }))
        .unwrap()
    }

    fn raw(class_id: u32, score: f32) -> RawDetection {
        RawDetection {
            bbox: [10.0, 10.0, 20.0, 20.0],
            score,
            class_id,
        }
    }

    #[test]
    fn test_score_and_class_filtering() {
        let detector = FixedDetector(vec![raw(0, 0.9), raw(2, 0.9), raw(0, 0.1)]);
        let mut handler = DetectionHandler::new(
            Box::new(detector),
            "detection-demo-topic".to_string(),
            &module(vec!["person".to_string()], false),
        );

        let outs = handler.on_frame(jpeg_envelope()).unwrap();
        assert_eq!(outs.len(), 1);
        let dets = outs[0].envelope.metadata.detections.as_ref().unwrap();
        // The car and the low-score person are filtered
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, "person");
    }

    #[test]
    fn test_skip_without_predict_drops_frame() {
        let detector = FixedDetector(vec![]);
        let mut handler = DetectionHandler::new(
            Box::new(detector),
            "detection-demo-topic".to_string(),
            &module(vec![], false),
        );
        assert!(handler.on_skipped(jpeg_envelope()).unwrap().is_empty());
    }

    #[test]
    fn test_skip_with_predict_emits_flagged_boxes() {
        let detector = FixedDetector(vec![raw(0, 0.9)]);
        let mut handler = DetectionHandler::new(
            Box::new(detector),
            "detection-demo-topic".to_string(),
            &module(vec![], true),
        );

        // Two real frames seed the predictor, then a skip coasts it
        handler.on_frame(jpeg_envelope()).unwrap();
        handler.on_frame(jpeg_envelope()).unwrap();
        let outs = handler.on_skipped(jpeg_envelope()).unwrap();

        assert_eq!(outs.len(), 1);
        let env = &outs[0].envelope;
        assert_eq!(env.metadata.predicted, Some(true));
        let dets = env.metadata.detections.as_ref().unwrap();
        assert!(!dets.is_empty());
        assert!(dets.iter().all(|d| d.predicted == Some(true)));
    }
}
