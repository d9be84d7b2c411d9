//! Object detector interface and its ONNX Runtime implementation
//!
//! The pipeline only depends on the [`Detector`] trait; the shipped
//! implementation runs an RT-DETR style model (combined `[1, N, 4+C]`
//! output, boxes as normalized cx/cy/w/h, class logits) through ONNX
//! Runtime.

use crate::error::{PipelineError, Result};
use image::RgbImage;
use ndarray::{Array, IxDyn};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use rayon::prelude::*;

/// COCO class names; detector class ids index into this table
pub const COCO_CLASSES: &[&str] = &[
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// Class name for a detector class id
pub fn class_name(class_id: u32) -> String {
    COCO_CLASSES
        .get(class_id as usize)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("class-{class_id}"))
}

/// One detection in pixel coordinates
#[derive(Debug, Clone)]
pub struct RawDetection {
    /// `[x, y, w, h]`, top-left origin
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: u32,
}

/// Common interface for object detectors
pub trait Detector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>>;
    fn name(&self) -> &str;
}

pub struct OnnxDetector {
    session: Session,
    input_size: (u32, u32),
    confidence_threshold: f32,
}

impl OnnxDetector {
    /// Load the model; a missing or unreadable model is fatal (exit 4).
    pub fn new(model_path: &str, confidence_threshold: f32) -> Result<Self> {
        log::info!("loading detection model from {model_path}");

        let session = Session::builder()
            .map_err(|e| PipelineError::model_load(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| PipelineError::model_load(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| {
                PipelineError::model_load(format!("failed to load model {model_path}: {e}"))
            })?;

        Ok(Self {
            session,
            input_size: (640, 640),
            confidence_threshold,
        })
    }

    /// Resize to the model input, normalize to [0,1], pack as CHW
    fn preprocess(&self, image: &RgbImage) -> Array<f32, IxDyn> {
        use image::imageops::FilterType;

        let (target_w, target_h) = self.input_size;
        let resized = image::DynamicImage::ImageRgb8(image.clone())
            .resize_exact(target_w, target_h, FilterType::Triangle)
            .to_rgb8();

        let pixel_rows: Vec<Vec<[f32; 3]>> = (0..target_h as usize)
            .into_par_iter()
            .map(|y| {
                (0..target_w as usize)
                    .map(|x| {
                        let pixel = resized.get_pixel(x as u32, y as u32);
                        [
                            pixel[0] as f32 / 255.0,
                            pixel[1] as f32 / 255.0,
                            pixel[2] as f32 / 255.0,
                        ]
                    })
                    .collect()
            })
            .collect();

        let mut input = Array::zeros((1, 3, target_h as usize, target_w as usize));
        for (y, row) in pixel_rows.iter().enumerate() {
            for (x, pixel) in row.iter().enumerate() {
                input[[0, 0, y, x]] = pixel[0];
                input[[0, 1, y, x]] = pixel[1];
                input[[0, 2, y, x]] = pixel[2];
            }
        }
        input.into_dyn()
    }

    /// Parse the combined `[1, N, 4+C]` output: softmax the class logits per
    /// query, keep queries above the confidence floor, scale boxes to pixels.
    fn postprocess(
        &self,
        output: &Array<f32, IxDyn>,
        orig_w: u32,
        orig_h: u32,
    ) -> Result<Vec<RawDetection>> {
        let shape = output.shape();
        if shape.len() != 3 || shape[2] <= 4 {
            return Err(PipelineError::inference(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        }
        let num_queries = shape[1];
        let num_classes = shape[2] - 4;

        let mut detections = Vec::new();
        for q in 0..num_queries {
            let cx = output[[0, q, 0]];
            let cy = output[[0, q, 1]];
            let w = output[[0, q, 2]];
            let h = output[[0, q, 3]];

            // Softmax over logits with the usual max-shift for stability
            let mut max_logit = f32::NEG_INFINITY;
            for c in 0..num_classes {
                max_logit = max_logit.max(output[[0, q, 4 + c]]);
            }
            let mut exp_sum = 0.0f32;
            for c in 0..num_classes {
                exp_sum += (output[[0, q, 4 + c]] - max_logit).exp();
            }

            let mut best_score = f32::NEG_INFINITY;
            let mut best_class = 0usize;
            for c in 0..num_classes {
                let prob = (output[[0, q, 4 + c]] - max_logit).exp() / exp_sum;
                if prob > best_score {
                    best_score = prob;
                    best_class = c;
                }
            }

            if best_score < self.confidence_threshold {
                continue;
            }

            let width = w * orig_w as f32;
            let height = h * orig_h as f32;
            let x = (cx * orig_w as f32 - width / 2.0).max(0.0);
            let y = (cy * orig_h as f32 - height / 2.0).max(0.0);

            detections.push(RawDetection {
                bbox: [x, y, width, height],
                score: best_score,
                class_id: best_class as u32,
            });
        }

        log::debug!("detector kept {} of {num_queries} queries", detections.len());
        Ok(detections)
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let (orig_w, orig_h) = image.dimensions();
        let input = self.preprocess(image);

        let tensor = TensorRef::from_array_view(&input)
            .map_err(|e| PipelineError::inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| PipelineError::inference(e.to_string()))?;

        let combined = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| PipelineError::inference(e.to_string()))?
            .into_owned();
        drop(outputs);

        self.postprocess(&combined, orig_w, orig_h)
    }

    fn name(&self) -> &str {
        "rt-detr-onnx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_name_lookup() {
        assert_eq!(class_name(0), "person");
        assert_eq!(class_name(2), "car");
        assert_eq!(class_name(999), "class-999");
    }
}
