//! Analytics stage: language-model insight over unified groups
//!
//! Single instance. Unified envelopes accumulate; every `log-wait-time`
//! seconds the newest combined image goes to the multimodal model together
//! with the group inventory, and the answer lands in `unified.log` and a
//! row of `unified.xlsx`. Model trouble is transient by definition here:
//! logged, retried on the next batch, never fatal.

use crate::config::{group_id, stage_topic, AnalyticsModuleConfig, StageConfig, STAGE_ANALYTICS};
use crate::envelope::{FrameEnvelope, GroupMember};
use crate::error::{PipelineError, Result};
use crate::llm::{VisionModelClient, VisionModelConfig};
use crate::messaging::{ConsumerSettings, MessageProducer};
use crate::runtime::{FrameHandler, Outbound, ShutdownToken, StageRuntime};
use crate::sync::wall_clock_now;
use chrono::Local;
use rust_xlsxwriter::Workbook;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

const SYSTEM_PROMPT: &str =
    "You are an AI assistant, helping in providing insight to camera outputs.";

struct ReportRow {
    time: String,
    frames: String,
    observation: String,
}

pub struct AnalyticsHandler {
    client: VisionModelClient,
    prompt: String,
    log_path: PathBuf,
    workbook_path: PathBuf,
    log_wait_time: f64,
    last_invoke: f64,
    /// Groups seen since the last model call
    pending: Vec<Vec<GroupMember>>,
    rows: Vec<ReportRow>,
}

impl AnalyticsHandler {
    pub fn new(module: &AnalyticsModuleConfig) -> Result<Self> {
        let output_dir = PathBuf::from(&module.output);
        std::fs::create_dir_all(&output_dir)?;

        let mut llm_config = VisionModelConfig {
            api_key: module.api_key.clone(),
            ..VisionModelConfig::default()
        };
        if let Some(url) = &module.api_url {
            llm_config.api_url = url.clone();
        }
        if let Some(model) = &module.model {
            llm_config.model = model.clone();
        }

        Ok(Self {
            client: VisionModelClient::new(llm_config),
            prompt: module.prompt.clone(),
            log_path: output_dir.join("unified.log"),
            workbook_path: output_dir.join("unified.xlsx"),
            log_wait_time: module.log_wait_time,
            last_invoke: wall_clock_now(),
            pending: Vec::new(),
            rows: Vec::new(),
        })
    }

    fn invoke_model(&mut self, envelope: &FrameEnvelope) -> Result<()> {
        let members = envelope.metadata.group.clone().unwrap_or_default();

        let mut cameras: Vec<String> = members.iter().map(|m| m.camera_id.clone()).collect();
        cameras.sort();
        cameras.dedup();
        let camera_context: Vec<String> =
            cameras.iter().map(|c| format!("Camera {c}")).collect();

        let prompt = format!(
            "There are {} cameras ({}). {}",
            cameras.len(),
            camera_context.join(", "),
            self.prompt
        );

        let response = self
            .client
            .describe(SYSTEM_PROMPT, &prompt, &envelope.image.b64)?;
        log::debug!("language model response: {response}");

        let mut sorted = members.clone();
        sorted.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        let info = sorted
            .iter()
            .map(|m| format!("{}-{}-{}", m.camera_id, m.frame_number, m.frame_timestamp))
            .collect::<Vec<_>>()
            .join(", ");

        let timestamp = Local::now().format("%Y/%m/%d %H:%M:%S%.3f").to_string();
        self.append_log(&timestamp, &info, &response)?;
        self.rows.push(ReportRow {
            time: timestamp,
            frames: info,
            observation: response,
        });
        self.save_workbook()?;
        Ok(())
    }

    fn append_log(&self, timestamp: &str, info: &str, response: &str) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "Time: {timestamp}")?;
        writeln!(file, "Camera-Frame Number-Frame Timestamp: {info}")?;
        writeln!(file, "Observation: {response}")?;
        writeln!(file, "{}", "-".repeat(50))?;
        Ok(())
    }

    /// Rewrite the report workbook with everything gathered so far
    fn save_workbook(&self) -> Result<()> {
        fn xlsx_err(e: rust_xlsxwriter::XlsxError) -> PipelineError {
            PipelineError::other(format!("workbook error: {e}"))
        }

        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name("unified").map_err(xlsx_err)?;
        worksheet.write_string(0, 0, "Time").map_err(xlsx_err)?;
        worksheet
            .write_string(0, 1, "Grouped Frames")
            .map_err(xlsx_err)?;
        worksheet
            .write_string(0, 2, "Observation")
            .map_err(xlsx_err)?;

        for (i, row) in self.rows.iter().enumerate() {
            let r = (i + 1) as u32;
            worksheet.write_string(r, 0, &row.time).map_err(xlsx_err)?;
            worksheet.write_string(r, 1, &row.frames).map_err(xlsx_err)?;
            worksheet
                .write_string(r, 2, &row.observation)
                .map_err(xlsx_err)?;
        }

        workbook.save(&self.workbook_path).map_err(xlsx_err)?;
        Ok(())
    }
}

impl FrameHandler for AnalyticsHandler {
    fn on_frame(&mut self, envelope: FrameEnvelope) -> Result<Vec<Outbound>> {
        self.pending
            .push(envelope.metadata.group.clone().unwrap_or_default());

        let now = wall_clock_now();
        if now - self.last_invoke >= self.log_wait_time {
            self.last_invoke = now;
            let batched = self.pending.len();
            self.pending.clear();
            log::info!("analyzing latest of {batched} outstanding group(s)");

            // Model failure must not poison the message; the next batch retries
            if let Err(e) = self.invoke_model(&envelope) {
                log::error!("analytics model invocation failed: {e}");
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_in(dir: &std::path::Path) -> AnalyticsHandler {
        let module: AnalyticsModuleConfig = serde_json::from_value(serde_json::json!({
            "output": dir.to_str().unwrap(),
            "log-wait-time": 5.0,
        }))
        .unwrap();
        AnalyticsHandler::new(&module).unwrap()
    }

    #[test]
    fn test_log_appends_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_in(dir.path());

        handler
            .append_log("2026/01/01 10:00:00", "cam-1-5-1.0", "two people crossing")
            .unwrap();
        handler
            .append_log("2026/01/01 10:00:30", "cam-1-6-2.0", "one person waiting")
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("unified.log")).unwrap();
        assert_eq!(log.matches("Observation:").count(), 2);
        assert!(log.contains("cam-1-5-1.0"));
    }

    #[test]
    fn test_workbook_rewrites_with_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler_in(dir.path());

        handler.rows.push(ReportRow {
            time: "2026/01/01 10:00:00".to_string(),
            frames: "cam-1-5-1.0".to_string(),
            observation: "quiet scene".to_string(),
        });
        handler.save_workbook().unwrap();
        assert!(dir.path().join("unified.xlsx").exists());

        handler.rows.push(ReportRow {
            time: "2026/01/01 10:00:30".to_string(),
            frames: "cam-1-6-2.0".to_string(),
            observation: "still quiet".to_string(),
        });
        handler.save_workbook().unwrap();
    }
}

/// Run the analytics worker from a parsed stage config
pub fn run(config: &StageConfig, shutdown: ShutdownToken) -> Result<()> {
    let module: AnalyticsModuleConfig = config.module()?;

    let producer = Arc::new(MessageProducer::new(&config.bootstrap_servers)?);
    let mut runtime = StageRuntime::new(
        STAGE_ANALYTICS,
        &config.pipeline,
        &config.bootstrap_servers,
        ConsumerSettings::new(
            stage_topic(crate::config::STAGE_UNIFICATION, &config.pipeline),
            group_id(&config.pipeline, STAGE_ANALYTICS, "main"),
        ),
        producer,
        config.sync_config()?,
        shutdown,
    )?;

    let mut handler = AnalyticsHandler::new(&module)?;
    runtime.run_frames(&mut handler)
}
