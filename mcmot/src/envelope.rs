//! Wire types crossing the stage topics
//!
//! The frame envelope is the unit flowing through every topic: image bytes
//! plus the metadata each stage appends. Stages may replace the image with
//! an annotated version but only ever append to the metadata.

use crate::error::{PipelineError, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Control signals accepted by the capture stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Start,
    Stop,
    Hold,
    Resume,
}

/// Message on the capture control topic `camera-<pipeline>-topic`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub pipeline: String,
    pub signal: Signal,
    #[serde(default = "default_loop_count")]
    pub loop_count: u32,
}

fn default_loop_count() -> u32 {
    1
}

/// Static per-camera description stamped by capture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// Binary image field: shape + dtype + base64 bytes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagePayload {
    /// `[height, width, channels]`
    pub shape: Vec<u32>,
    pub dtype: String,
    pub b64: String,
}

impl ImagePayload {
    /// Wrap encoded JPEG bytes
    pub fn from_jpeg(bytes: &[u8], width: u32, height: u32) -> Self {
        Self {
            shape: vec![height, width, 3],
            dtype: "uint8".to_string(),
            b64: BASE64_STANDARD.encode(bytes),
        }
    }

    /// Recover the encoded JPEG bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        BASE64_STANDARD
            .decode(&self.b64)
            .map_err(|e| PipelineError::codec(format!("image payload is not valid base64: {e}")))
    }

    pub fn width(&self) -> u32 {
        self.shape.get(1).copied().unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.shape.first().copied().unwrap_or(0)
    }
}

/// One detected object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// `[x, y, w, h]` in pixels, top-left origin
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reid_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted: Option<bool>,
}

/// One tracked object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRecord {
    /// `[x, y, w, h]` in pixels, top-left origin
    pub bbox: [f32; 4],
    pub track_id: String,
    pub class_id: String,
    pub confirmed: bool,
}

/// Group member reference carried by unified envelopes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub camera_id: String,
    pub frame_number: u64,
    pub frame_timestamp: f64,
}

/// Stage-appended metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    /// Measured production rate, distinct from the declared fps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<Detection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<TrackRecord>>,
    /// Set when the frame content was produced by Kalman prediction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted: Option<bool>,
    /// Set on unified groups emitted before all cameras reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Vec<GroupMember>>,
}

/// The unit crossing every stage topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub camera_id: String,
    pub frame_number: u64,
    /// Seconds since epoch
    pub frame_timestamp: f64,
    /// Declared rate; 0 means "use the envelope stream's own pacing"
    pub fps: u32,
    pub image: ImagePayload,
    #[serde(default)]
    pub metadata: FrameMetadata,
    #[serde(default)]
    pub camera_metadata: CameraMetadata,
}

impl FrameEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Envelope with the image dropped, for metadata-only persistence
    pub fn without_image(&self) -> FrameEnvelope {
        let mut stripped = self.clone();
        stripped.image = ImagePayload::default();
        stripped
    }
}
