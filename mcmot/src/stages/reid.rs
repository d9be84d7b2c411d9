//! ReID stage: globally consistent identities from appearance embeddings
//!
//! Each detection is cropped, embedded, and matched against an in-memory
//! store by cosine similarity. A hit reuses the stored identity; a miss
//! allocates a fresh UUID. The store is worker-local: horizontal scaling
//! trades identity consistency for parallelism, and downstream stages
//! reconcile by spatial correlation.

use crate::config::{group_id, stage_topic, ReidModuleConfig, StageConfig, STAGE_REID};
use crate::embedder::{cosine_similarity, Embedder, OnnxEmbedder};
use crate::envelope::FrameEnvelope;
use crate::error::Result;
use crate::messaging::{ConsumerSettings, MessageProducer};
use crate::runtime::{FrameHandler, Outbound, ShutdownToken, StageRuntime};
use image::RgbImage;
use std::sync::Arc;
use uuid::Uuid;

/// Insertion-ordered identity store with a soft capacity
pub struct EmbeddingStore {
    entries: Vec<(String, Vec<f32>)>,
    capacity: usize,
    similarity_threshold: f32,
}

impl EmbeddingStore {
    pub fn new(capacity: usize, similarity_threshold: f32) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            similarity_threshold,
        }
    }

    /// Best stored identity for an embedding, if any clears the threshold
    pub fn lookup(&self, embedding: &[f32]) -> Option<(&str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for (id, stored) in &self.entries {
            let similarity = cosine_similarity(embedding, stored);
            if similarity >= self.similarity_threshold
                && best.map(|(_, s)| similarity > s).unwrap_or(true)
            {
                best = Some((id.as_str(), similarity));
            }
        }
        best
    }

    /// Match or mint: returns the assigned identity and the similarity of a
    /// hit (None for a fresh identity).
    pub fn assign(&mut self, embedding: &[f32]) -> (String, Option<f32>) {
        if let Some((id, similarity)) = self.lookup(embedding) {
            return (id.to_string(), Some(similarity));
        }

        let id = Uuid::new_v4().to_string();
        self.entries.push((id.clone(), embedding.to_vec()));
        if self.capacity > 0 && self.entries.len() > self.capacity {
            let (evicted, _) = self.entries.remove(0);
            log::debug!("embedding store over capacity, evicted oldest identity {evicted}");
        }
        (id, None)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Clamp a `[x, y, w, h]` box to image bounds and crop it
fn crop_detection(image: &RgbImage, bbox: [f32; 4]) -> Option<RgbImage> {
    let (img_w, img_h) = image.dimensions();
    let x = bbox[0].max(0.0) as u32;
    let y = bbox[1].max(0.0) as u32;
    if x >= img_w || y >= img_h {
        return None;
    }
    let w = (bbox[2].max(0.0) as u32).min(img_w - x);
    let h = (bbox[3].max(0.0) as u32).min(img_h - y);
    if w == 0 || h == 0 {
        return None;
    }
    Some(image::imageops::crop_imm(image, x, y, w, h).to_image())
}

pub struct ReidHandler {
    embedder: Box<dyn Embedder>,
    store: EmbeddingStore,
    outbound_topic: String,
}

impl ReidHandler {
    pub fn new(embedder: Box<dyn Embedder>, store: EmbeddingStore, outbound_topic: String) -> Self {
        Self {
            embedder,
            store,
            outbound_topic,
        }
    }
}

impl FrameHandler for ReidHandler {
    fn on_frame(&mut self, mut envelope: FrameEnvelope) -> Result<Vec<Outbound>> {
        let Some(mut detections) = envelope.metadata.detections.take() else {
            // Nothing to identify; pass the frame through
            return Ok(vec![Outbound::keyed(self.outbound_topic.clone(), envelope)]);
        };

        let jpeg = envelope.image.to_bytes()?;
        let image = image::load_from_memory(&jpeg)?.to_rgb8();

        for detection in &mut detections {
            let Some(crop) = crop_detection(&image, detection.bbox) else {
                log::debug!(
                    "camera {}: detection box {:?} outside frame, skipped",
                    envelope.camera_id,
                    detection.bbox
                );
                continue;
            };

            let embedding = self.embedder.embed(&crop)?;
            let (reid_id, similarity) = self.store.assign(&embedding);
            match similarity {
                Some(s) => log::debug!(
                    "camera {}: matched identity {reid_id} at similarity {s:.3}",
                    envelope.camera_id
                ),
                None => log::debug!(
                    "camera {}: new identity {reid_id} ({} stored)",
                    envelope.camera_id,
                    self.store.len()
                ),
            }
            detection.reid_id = Some(reid_id);
        }

        envelope.metadata.detections = Some(detections);
        Ok(vec![Outbound::keyed(self.outbound_topic.clone(), envelope)])
    }
}

/// Run the reid worker from a parsed stage config
pub fn run(config: &StageConfig, shutdown: ShutdownToken) -> Result<()> {
    let module: ReidModuleConfig = config.module()?;
    let embedder = OnnxEmbedder::new(&module.model)?;
    let store = EmbeddingStore::new(module.store_capacity, module.similarity_threshold);

    let producer = Arc::new(MessageProducer::new(&config.bootstrap_servers)?);
    let mut runtime = StageRuntime::new(
        STAGE_REID,
        &config.pipeline,
        &config.bootstrap_servers,
        ConsumerSettings::new(
            stage_topic(crate::config::STAGE_DETECTION, &config.pipeline),
            group_id(&config.pipeline, STAGE_REID, "main"),
        ),
        producer,
        config.sync_config()?,
        shutdown,
    )?;

    let mut handler = ReidHandler::new(
        Box::new(embedder),
        store,
        stage_topic(STAGE_REID, &config.pipeline),
    );
    runtime.run_frames(&mut handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CameraMetadata, Detection, FrameMetadata, ImagePayload};

    #[test]
    fn test_store_hit_is_stable() {
        let mut store = EmbeddingStore::new(10, 0.7);
        let v = vec![1.0, 0.0, 0.0];

        let (id1, sim1) = store.assign(&v);
        assert!(sim1.is_none());
        let (id2, sim2) = store.assign(&v);
        assert_eq!(id1, id2);
        assert!(sim2.unwrap() > 0.99);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_miss_allocates() {
        let mut store = EmbeddingStore::new(10, 0.7);
        let (id1, _) = store.assign(&[1.0, 0.0, 0.0]);
        let (id2, _) = store.assign(&[0.0, 1.0, 0.0]);
        assert_ne!(id1, id2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_store_prefers_best_match() {
        let mut store = EmbeddingStore::new(10, 0.5);
        let (close_id, _) = store.assign(&[1.0, 0.1, 0.0]);
        let (_far_id, _) = store.assign(&[0.0, 0.0, 1.0]);

        let (assigned, sim) = store.assign(&[1.0, 0.05, 0.0]);
        assert_eq!(assigned, close_id);
        assert!(sim.unwrap() > 0.9);
    }

    #[test]
    fn test_store_soft_cap_evicts_oldest() {
        let mut store = EmbeddingStore::new(2, 0.99);
        let (first, _) = store.assign(&[1.0, 0.0, 0.0]);
        store.assign(&[0.0, 1.0, 0.0]);
        store.assign(&[0.0, 0.0, 1.0]);
        assert_eq!(store.len(), 2);

        // The first identity is gone; the same vector now mints a new one
        let (again, sim) = store.assign(&[1.0, 0.0, 0.0]);
        assert_ne!(again, first);
        assert!(sim.is_none());
    }

    #[test]
    fn test_crop_clamps_to_bounds() {
        let image = RgbImage::new(100, 50);
        let crop = crop_detection(&image, [90.0, 40.0, 50.0, 50.0]).unwrap();
        assert_eq!(crop.dimensions(), (10, 10));

        assert!(crop_detection(&image, [200.0, 10.0, 5.0, 5.0]).is_none());
        assert!(crop_detection(&image, [10.0, 10.0, 0.0, 5.0]).is_none());
    }

    /// Embedder that hashes the crop size into a one-hot vector
    struct StubEmbedder;

    impl Embedder for StubEmbedder {
        fn embed(&mut self, crop: &RgbImage) -> Result<Vec<f32>> {
            let (w, _) = crop.dimensions();
            let mut v = vec![0.0f32; 4];
            v[(w as usize) % 4] = 1.0;
            Ok(v)
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    #[test]
    fn test_handler_assigns_reid_ids() {
        let store = EmbeddingStore::new(16, 0.7);
        let mut handler =
            ReidHandler::new(Box::new(StubEmbedder), store, "reid-demo-topic".to_string());

        let img = image::RgbImage::from_pixel(32, 32, image::Rgb([10, 20, 30]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let envelope = FrameEnvelope {
            camera_id: "cam-1".to_string(),
            frame_number: 1,
            frame_timestamp: 1.0,
            fps: 30,
            image: ImagePayload::from_jpeg(&jpeg, 32, 32),
            metadata: FrameMetadata {
                detections: Some(vec![
                    Detection {
                        bbox: [0.0, 0.0, 9.0, 16.0],
                        score: 0.9,
                        class_id: "person".to_string(),
                        reid_id: None,
                        predicted: None,
                    },
                    Detection {
                        bbox: [10.0, 0.0, 9.0, 16.0],
                        score: 0.8,
                        class_id: "person".to_string(),
                        reid_id: None,
                        predicted: None,
                    },
                ]),
                ..FrameMetadata::default()
            },
            camera_metadata: CameraMetadata::default(),
        };

        let outs = handler.on_frame(envelope).unwrap();
        let dets = outs[0].envelope.metadata.detections.as_ref().unwrap();
        assert!(dets.iter().all(|d| d.reid_id.is_some()));
        // Same crop size -> same embedding -> same identity
        assert_eq!(dets[0].reid_id, dets[1].reid_id);
    }
}
