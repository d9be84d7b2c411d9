//! Configuration records and the argv JSON convention
//!
//! Every binary takes a single argument: either a path to a JSON file or an
//! inline JSON string. Parsing failures are config errors and exit 2.

use crate::error::{PipelineError, Result};
use crate::sync::{SyncConfig, SyncType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const STAGE_CAPTURE: &str = "capture";
pub const STAGE_DETECTION: &str = "detection";
pub const STAGE_REID: &str = "reid";
pub const STAGE_TRACKER: &str = "tracker";
pub const STAGE_UNIFICATION: &str = "unification";
pub const STAGE_ANALYTICS: &str = "analytics";

/// All pipeline stages, in flow order
pub const STAGES: [&str; 6] = [
    STAGE_CAPTURE,
    STAGE_DETECTION,
    STAGE_REID,
    STAGE_TRACKER,
    STAGE_UNIFICATION,
    STAGE_ANALYTICS,
];

/// `<stage>-<pipeline>-topic`
pub fn stage_topic(stage: &str, pipeline: &str) -> String {
    format!("{stage}-{pipeline}-topic")
}

/// The capture control topic
pub fn control_topic(pipeline: &str) -> String {
    format!("camera-{pipeline}-topic")
}

/// Dead-letter topic for a stage
pub fn dlq_topic(stage: &str, pipeline: &str) -> String {
    format!("{stage}-{pipeline}-dlq")
}

/// Consumer group id `<pipeline>-<stage>-<role>`
pub fn group_id(pipeline: &str, stage: &str, role: &str) -> String {
    format!("{pipeline}-{stage}-{role}")
}

/// Read the first CLI argument as a JSON document: a `.json` file path or an
/// inline JSON string.
pub fn read_config_arg() -> Result<serde_json::Value> {
    let arg = std::env::args().nth(1).ok_or_else(|| {
        PipelineError::config(
            "missing JSON input: pass a JSON string or a JSON file path as the first argument",
        )
    })?;
    parse_config_arg(&arg)
}

/// Parse a path-or-inline JSON argument
pub fn parse_config_arg(arg: &str) -> Result<serde_json::Value> {
    if arg.ends_with(".json") {
        let text = std::fs::read_to_string(Path::new(arg))
            .map_err(|e| PipelineError::config(format!("cannot read config file {arg}: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| PipelineError::config(format!("invalid JSON in {arg}: {e}")))
    } else {
        serde_json::from_str(arg)
            .map_err(|e| PipelineError::config(format!("invalid inline JSON: {e}")))
    }
}

/// Deserialize a parsed config value into a typed record
pub fn from_value<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| PipelineError::config(e.to_string()))
}

fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

/// Frame-sync block of a stage config, in its on-disk spelling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameSyncSettings {
    #[serde(rename = "type", default)]
    pub sync_type: Option<String>,
    #[serde(rename = "backlog-threshold", default)]
    pub backlog_threshold: usize,
    #[serde(rename = "backlog-check-interval", default = "default_backlog_interval")]
    pub backlog_check_interval: f64,
    #[serde(default)]
    pub fps: u32,
    #[serde(rename = "retention-time", default = "default_retention_time")]
    pub retention_time: f64,
    #[serde(rename = "latency-threshold", default = "default_latency_threshold")]
    pub latency_threshold: f64,
    #[serde(rename = "ignore-initial-delay", default)]
    pub ignore_initial_delay: bool,
    #[serde(rename = "enable-sequencing", default)]
    pub enable_sequencing: bool,
    #[serde(rename = "seek-to-end", default)]
    pub seek_to_end: bool,
    #[serde(default)]
    pub unify: bool,
}

fn default_backlog_interval() -> f64 {
    1.0
}

fn default_retention_time() -> f64 {
    60.0
}

fn default_latency_threshold() -> f64 {
    60.0
}

impl FrameSyncSettings {
    /// Convert to the validated engine configuration
    pub fn to_sync_config(&self) -> Result<SyncConfig> {
        let sync_type = match self.sync_type.as_deref() {
            None | Some("none") => None,
            Some("number") => Some(SyncType::Number),
            Some("timestamp") => Some(SyncType::Timestamp),
            Some(other) => {
                return Err(PipelineError::config(format!(
                    "frame-sync type must be 'number', 'timestamp' or 'none', got '{other}'"
                )))
            }
        };

        let config = SyncConfig {
            sync_type,
            fps: self.fps,
            backlog_threshold: self.backlog_threshold,
            backlog_check_interval: self.backlog_check_interval,
            retention_time: self.retention_time,
            latency_threshold: self.latency_threshold,
            ignore_initial_delay: self.ignore_initial_delay,
            enable_sequencing: self.enable_sequencing,
            seek_to_end: self.seek_to_end,
            unify: self.unify,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Common shape of a per-stage worker config
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub pipeline: String,
    #[serde(rename = "bootstrap-servers", default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,
    #[serde(rename = "module-config", default)]
    pub module_config: serde_json::Value,
    #[serde(rename = "frame-sync", default)]
    pub frame_sync: Option<FrameSyncSettings>,
}

impl StageConfig {
    pub fn from_args() -> Result<Self> {
        from_value(read_config_arg()?)
    }

    /// Deserialize the stage-specific `module-config` block
    pub fn module<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.module_config.clone())
            .map_err(|e| PipelineError::config(format!("invalid module-config: {e}")))
    }

    pub fn sync_config(&self) -> Result<Option<SyncConfig>> {
        match &self.frame_sync {
            Some(settings) => Ok(Some(settings.to_sync_config()?)),
            None => Ok(None),
        }
    }
}

/// Capture stage module config
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureModuleConfig {
    #[serde(rename = "camera-id")]
    pub camera_id: String,
    pub location: Option<String>,
    /// Video file path or live stream URL; defaults to the per-location
    /// layout used by the demo assets.
    pub video: Option<String>,
    #[serde(default = "default_video_format")]
    pub format: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_video_format() -> String {
    "avi".to_string()
}

fn default_compression() -> String {
    "H.265".to_string()
}

fn default_bitrate() -> String {
    "6Mbps".to_string()
}

fn default_encoding() -> String {
    "HEVC".to_string()
}

impl CaptureModuleConfig {
    pub fn video_path(&self) -> String {
        if let Some(video) = &self.video {
            return video.clone();
        }
        let location = self.location.as_deref().unwrap_or("default");
        format!(
            "capture/video/{location}/{location}-{}.{}",
            self.camera_id, self.format
        )
    }
}

/// Detection stage module config
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionModuleConfig {
    #[serde(default = "default_detection_model")]
    pub model: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(rename = "confidence-score", default = "default_confidence_score")]
    pub confidence_score: f32,
    #[serde(default)]
    pub predict: bool,
}

fn default_detection_model() -> String {
    "model/rtdetr-l.onnx".to_string()
}

fn default_confidence_score() -> f32 {
    0.3
}

/// ReID stage module config
#[derive(Debug, Clone, Deserialize)]
pub struct ReidModuleConfig {
    #[serde(default = "default_reid_model")]
    pub model: String,
    #[serde(rename = "similarity-threshold", default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(rename = "store-capacity", default = "default_store_capacity")]
    pub store_capacity: usize,
}

fn default_reid_model() -> String {
    "model/osnet_x1_0.onnx".to_string()
}

fn default_similarity_threshold() -> f32 {
    0.7
}

fn default_store_capacity() -> usize {
    4096
}

/// Tracker stage module config
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerModuleConfig {
    #[serde(rename = "max-iou-distance", default = "default_max_iou_distance")]
    pub max_iou_distance: f32,
    #[serde(rename = "max-age", default = "default_max_age")]
    pub max_age: u32,
    #[serde(rename = "n-init", default = "default_n_init")]
    pub n_init: u32,
    #[serde(rename = "nms-max-overlap", default = "default_nms_max_overlap")]
    pub nms_max_overlap: f32,
    #[serde(
        rename = "detection-score-threshold",
        default = "default_detection_score_threshold"
    )]
    pub detection_score_threshold: f32,
    #[serde(rename = "ignore-capture", default)]
    pub ignore_capture: bool,
    #[serde(rename = "prediction-factor", default)]
    pub prediction_factor: f32,
    #[serde(rename = "only-confirmed-tracks", default)]
    pub only_confirmed_tracks: bool,
    /// Pin this worker to a single camera's partition key
    #[serde(rename = "camera-id", default)]
    pub camera_id: Option<String>,
    /// Name of the upstream detection-class stage feeding this tracker
    #[serde(rename = "detection-module-name", default = "default_detection_module")]
    pub detection_module: String,
}

fn default_max_iou_distance() -> f32 {
    0.7
}

fn default_max_age() -> u32 {
    100
}

fn default_n_init() -> u32 {
    3
}

fn default_nms_max_overlap() -> f32 {
    1.0
}

fn default_detection_score_threshold() -> f32 {
    0.7
}

fn default_detection_module() -> String {
    STAGE_DETECTION.to_string()
}

/// Unification stage module config
#[derive(Debug, Clone, Deserialize)]
pub struct UnificationModuleConfig {
    #[serde(default = "default_output_path")]
    pub output: String,
}

fn default_output_path() -> String {
    "./output".to_string()
}

/// Analytics stage module config
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsModuleConfig {
    #[serde(default = "default_output_path")]
    pub output: String,
    #[serde(rename = "log-wait-time", default = "default_log_wait_time")]
    pub log_wait_time: f64,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(rename = "api-url", default)]
    pub api_url: Option<String>,
    #[serde(rename = "api-key", default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_log_wait_time() -> f64 {
    30.0
}

fn default_prompt() -> String {
    "Provide insight to the image".to_string()
}

/// `setup` binary config: topic layout for one pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct SetupConfig {
    pub pipeline: String,
    #[serde(rename = "bootstrap-servers", default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,
    /// `{stage -> partitions}`; stages absent from the map get one partition
    #[serde(default)]
    pub topics: BTreeMap<String, i32>,
}

/// One entry of the `start` binary's pipeline config
#[derive(Debug, Clone, Deserialize)]
pub struct FleetEntry {
    pub name: String,
    /// Worker config: a file path string or an inline JSON object
    pub config: serde_json::Value,
    #[serde(rename = "replication-factor", default = "default_replication")]
    pub replication_factor: u32,
    #[serde(default)]
    pub observability: bool,
}

fn default_replication() -> u32 {
    1
}

/// `signal` binary config
#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    pub pipeline: String,
    #[serde(rename = "bootstrap-servers", default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,
    pub signal: crate::envelope::Signal,
    #[serde(rename = "loop-count", default = "default_signal_loops")]
    pub loop_count: u32,
}

fn default_signal_loops() -> u32 {
    1
}
