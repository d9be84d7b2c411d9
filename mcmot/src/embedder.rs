//! Appearance embedder interface and its ONNX Runtime implementation
//!
//! ReID crops run through an OSNet-style model producing a fixed-dimension
//! appearance vector; the stage matches vectors by cosine similarity.

use crate::error::{PipelineError, Result};
use image::RgbImage;
use ndarray::{Array, IxDyn};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};

/// Per-channel normalization used by ImageNet-pretrained backbones
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Common interface for appearance embedders
pub trait Embedder: Send {
    /// Fixed-dimension embedding of an image crop, L2-normalized
    fn embed(&mut self, crop: &RgbImage) -> Result<Vec<f32>>;
    fn name(&self) -> &str;
}

pub struct OnnxEmbedder {
    session: Session,
    /// (width, height) expected by the model
    input_size: (u32, u32),
}

impl OnnxEmbedder {
    /// Load the model; a missing or unreadable model is fatal (exit 4).
    pub fn new(model_path: &str) -> Result<Self> {
        log::info!("loading reid model from {model_path}");

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
            input_size: (128, 256),
        })
    }

    fn preprocess(&self, crop: &RgbImage) -> Array<f32, IxDyn> {
        use image::imageops::FilterType;

        let (target_w, target_h) = self.input_size;
        let resized = image::DynamicImage::ImageRgb8(crop.clone())
            .resize_exact(target_w, target_h, FilterType::Triangle)
            .to_rgb8();

        let mut input = Array::zeros((1, 3, target_h as usize, target_w as usize));
        for y in 0..target_h as usize {
            for x in 0..target_w as usize {
                let pixel = resized.get_pixel(x as u32, y as u32);
                for c in 0..3 {
                    input[[0, c, y, x]] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
                }
            }
        }
        input.into_dyn()
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&mut self, crop: &RgbImage) -> Result<Vec<f32>> {
        let input = self.preprocess(crop);

        let tensor = TensorRef::from_array_view(&input)
            .map_err(|e| PipelineError::inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| PipelineError::inference(e.to_string()))?;

        let embedding = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| PipelineError::inference(e.to_string()))?
            .iter()
            .copied()
            .collect::<Vec<f32>>();
        drop(outputs);

        if embedding.is_empty() {
            return Err(PipelineError::inference("embedder produced no output"));
        }
        Ok(l2_normalize(embedding))
    }

    fn name(&self) -> &str {
        "osnet-onnx"
    }
}

/// Scale a vector to unit length; zero vectors pass through untouched
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity of two vectors; 0 when either is degenerate
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
