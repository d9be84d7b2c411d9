//! Unification stage: cross-camera group composition
//!
//! Single-instance stage running the sync engine in unify mode. Each
//! emitted group (complete, or partial after retention) is annotated,
//! written under `output/<sync_key>/`, composed into a row-major grid
//! image, appended to a combined video whose writer closes after 60 s of
//! inactivity, and republished as one unified envelope.

use crate::config::{group_id, stage_topic, StageConfig, UnificationModuleConfig, STAGE_UNIFICATION};
use crate::envelope::{
    CameraMetadata, FrameEnvelope, FrameMetadata, GroupMember, ImagePayload,
};
use crate::error::{PipelineError, Result};
use crate::messaging::{ConsumerSettings, MessageProducer};
use crate::runtime::{GroupHandler, Outbound, ShutdownToken, StageRuntime};
use crate::sync::{wall_clock_now, SyncGroup};
use opencv::core::{Mat, Point, Rect, Scalar, Size, Vector, CV_8UC3};
use opencv::prelude::*;
use opencv::videoio::VideoWriter;
use opencv::{imgcodecs, imgproc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Seconds of inactivity after which the video writer is released
const VIDEO_IDLE_TIMEOUT: f64 = 60.0;
/// Output video geometry
const VIDEO_SIZE: (i32, i32) = (1280, 720);
const VIDEO_FPS: f64 = 30.0;

const TEXT_COLOR: (f64, f64, f64) = (0.0, 255.0, 255.0); // yellow, BGR
const BOX_COLOR: (f64, f64, f64) = (0.0, 255.0, 0.0);

fn scalar(bgr: (f64, f64, f64)) -> Scalar {
    Scalar::new(bgr.0, bgr.1, bgr.2, 0.0)
}

/// Lazily opened combined-video writer with idle tracking
pub struct VideoSink {
    writer: Option<VideoWriter>,
    last_write: f64,
    path: PathBuf,
}

impl VideoSink {
    fn write(&mut self, frame: &Mat) -> Result<()> {
        if self.writer.is_none() {
            let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
            let writer = VideoWriter::new(
                &self.path.to_string_lossy(),
                fourcc,
                VIDEO_FPS,
                Size::new(VIDEO_SIZE.0, VIDEO_SIZE.1),
                true,
            )?;
            if !writer.is_opened()? {
                return Err(PipelineError::codec(format!(
                    "cannot open video writer at {}",
                    self.path.display()
                )));
            }
            log::info!("combined video writer opened at {}", self.path.display());
            self.writer = Some(writer);
        }

        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(VIDEO_SIZE.0, VIDEO_SIZE.1),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;
        if let Some(writer) = &mut self.writer {
            writer.write(&resized)?;
        }
        self.last_write = wall_clock_now();
        Ok(())
    }

    fn close_if_idle(&mut self, now: f64) {
        if self.writer.is_some() && now - self.last_write > VIDEO_IDLE_TIMEOUT {
            self.writer = None;
            log::info!("combined video writer closed after inactivity");
        }
    }
}

/// Decode and annotate one member frame: boxes, camera id, frame number,
/// timestamp.
fn annotate_frame(envelope: &FrameEnvelope) -> Result<Mat> {
    let jpeg = envelope.image.to_bytes()?;
    let buffer = Vector::<u8>::from_slice(&jpeg);
    let mut frame = imgcodecs::imdecode(&buffer, imgcodecs::IMREAD_COLOR)?;
    if frame.empty() {
        return Err(PipelineError::codec(format!(
            "camera {}: frame {} failed to decode",
            envelope.camera_id, envelope.frame_number
        )));
    }

    let height = frame.rows();
    let width = frame.cols();
    let font_scale = (height as f64 / 850.0).max(0.35);

    // Track boxes take precedence over raw detections
    if let Some(tracks) = &envelope.metadata.tracks {
        for track in tracks {
            draw_box(
                &mut frame,
                track.bbox,
                &format!("id: {}", track.track_id),
                font_scale,
            )?;
        }
    } else if let Some(detections) = &envelope.metadata.detections {
        for detection in detections {
            let label = detection
                .reid_id
                .as_deref()
                .map(|id| format!("id: {id}"))
                .unwrap_or_else(|| detection.class_id.clone());
            draw_box(&mut frame, detection.bbox, &label, font_scale)?;
        }
    }

    let text_color = scalar(TEXT_COLOR);
    imgproc::put_text(
        &mut frame,
        &format!("Camera: {}", envelope.camera_id),
        Point::new(10, 20),
        imgproc::FONT_HERSHEY_SIMPLEX,
        font_scale,
        text_color,
        1,
        imgproc::LINE_8,
        false,
    )?;
    imgproc::put_text(
        &mut frame,
        &format!("Frame: {}", envelope.frame_number),
        Point::new((width - 130).max(0), 20),
        imgproc::FONT_HERSHEY_SIMPLEX,
        font_scale,
        text_color,
        1,
        imgproc::LINE_8,
        false,
    )?;
    imgproc::put_text(
        &mut frame,
        &format!("Timestamp: {:.3}", envelope.frame_timestamp),
        Point::new(10, (height - 10).max(0)),
        imgproc::FONT_HERSHEY_SIMPLEX,
        font_scale,
        text_color,
        1,
        imgproc::LINE_8,
        false,
    )?;

    Ok(frame)
}

fn draw_box(frame: &mut Mat, bbox: [f32; 4], label: &str, font_scale: f64) -> Result<()> {
    let rect = Rect::new(
        bbox[0] as i32,
        bbox[1] as i32,
        bbox[2] as i32,
        bbox[3] as i32,
    );
    let color = scalar(BOX_COLOR);
    imgproc::rectangle(frame, rect, color, 1, imgproc::LINE_8, 0)?;
    imgproc::put_text(
        frame,
        label,
        Point::new(rect.x, (rect.y - 10).max(0)),
        imgproc::FONT_HERSHEY_SIMPLEX,
        font_scale,
        color,
        1,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// Row-major grid, two frames per row, zero-padded tail. Frames are
/// normalized to the first frame's geometry first.
fn combine_frames(frames: &[Mat]) -> Result<Mat> {
    if frames.is_empty() {
        return Err(PipelineError::other("no frames to combine"));
    }

    let cell = Size::new(frames[0].cols(), frames[0].rows());
    let mut cells = Vec::with_capacity(frames.len());
    for frame in frames {
        if frame.cols() == cell.width && frame.rows() == cell.height {
            cells.push(frame.clone());
        } else {
            let mut resized = Mat::default();
            imgproc::resize(frame, &mut resized, cell, 0.0, 0.0, imgproc::INTER_LINEAR)?;
            cells.push(resized);
        }
    }

    let mut rows = Vec::new();
    for pair in cells.chunks(2) {
        let left = &pair[0];
        let right = match pair.get(1) {
            Some(frame) => frame.clone(),
            None => Mat::zeros(cell.height, cell.width, CV_8UC3)?.to_mat()?,
        };
        let mut row = Mat::default();
        opencv::core::hconcat2(left, &right, &mut row)?;
        rows.push(row);
    }

    let mut combined = rows[0].clone();
    for row in &rows[1..] {
        let mut stacked = Mat::default();
        opencv::core::vconcat2(&combined, row, &mut stacked)?;
        combined = stacked;
    }
    Ok(combined)
}

pub struct UnificationHandler {
    output_dir: PathBuf,
    outbound_topic: String,
    sink: Arc<Mutex<VideoSink>>,
}

impl UnificationHandler {
    pub fn new(output_dir: &str, outbound_topic: String) -> Result<Self> {
        let output_dir = PathBuf::from(output_dir);
        std::fs::create_dir_all(&output_dir)?;

        let sink = Arc::new(Mutex::new(VideoSink {
            writer: None,
            last_write: wall_clock_now(),
            path: output_dir.join("combined.mp4"),
        }));

        Ok(Self {
            output_dir,
            outbound_topic,
            sink,
        })
    }

    /// Hand the sink to the inactivity watcher thread
    pub fn sink(&self) -> Arc<Mutex<VideoSink>> {
        Arc::clone(&self.sink)
    }

    fn write_group_outputs(
        &self,
        group: &SyncGroup,
        annotated: &[Mat],
        combined: &Mat,
    ) -> Result<PathBuf> {
        let group_dir = self.output_dir.join(group.sync_key.to_string());
        std::fs::create_dir_all(&group_dir)?;

        for (envelope, frame) in group.frames.iter().zip(annotated) {
            let path = group_dir.join(format!("frame_{}.jpg", envelope.camera_id));
            write_jpeg(&path, frame)?;
        }
        write_jpeg(&group_dir.join("combined.jpg"), combined)?;

        // Metadata persists without the image bytes
        let stripped: Vec<FrameEnvelope> =
            group.frames.iter().map(|e| e.without_image()).collect();
        let metadata = serde_json::json!({
            "sync_key": group.sync_key,
            "complete": group.complete,
            "frames": stripped,
        });
        std::fs::write(
            group_dir.join("metadata.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        Ok(group_dir)
    }
}

fn write_jpeg(path: &Path, frame: &Mat) -> Result<()> {
    let mut buffer = Vector::<u8>::new();
    imgcodecs::imencode(".jpg", frame, &mut buffer, &Vector::new())?;
    std::fs::write(path, buffer.as_slice())?;
    Ok(())
}

impl GroupHandler for UnificationHandler {
    fn on_group(&mut self, group: SyncGroup) -> Result<Vec<Outbound>> {
        if group.frames.is_empty() {
            return Ok(Vec::new());
        }
        log::info!(
            "unifying group {} ({} camera(s), complete={})",
            group.sync_key,
            group.frames.len(),
            group.complete
        );

        let annotated: Vec<Mat> = group
            .frames
            .iter()
            .map(annotate_frame)
            .collect::<Result<_>>()?;
        let combined = combine_frames(&annotated)?;

        self.write_group_outputs(&group, &annotated, &combined)?;

        {
            let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
            sink.write(&combined)?;
        }

        // Republish the group as one unified envelope
        let mut jpeg = Vector::<u8>::new();
        imgcodecs::imencode(".jpg", &combined, &mut jpeg, &Vector::new())?;

        let members: Vec<GroupMember> = group
            .frames
            .iter()
            .map(|e| GroupMember {
                camera_id: e.camera_id.clone(),
                frame_number: e.frame_number,
                frame_timestamp: e.frame_timestamp,
            })
            .collect();
        let first = &group.frames[0];

        let unified = FrameEnvelope {
            camera_id: "unified".to_string(),
            frame_number: group.sync_key.max(0) as u64,
            frame_timestamp: group
                .frames
                .iter()
                .map(|e| e.frame_timestamp)
                .fold(f64::INFINITY, f64::min),
            fps: first.fps,
            image: ImagePayload::from_jpeg(
                jpeg.as_slice(),
                combined.cols() as u32,
                combined.rows() as u32,
            ),
            metadata: FrameMetadata {
                group: Some(members),
                incomplete: (!group.complete).then_some(true),
                ..FrameMetadata::default()
            },
            camera_metadata: CameraMetadata::default(),
        };

        Ok(vec![Outbound::unkeyed(self.outbound_topic.clone(), unified)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(rows: i32, cols: i32) -> Mat {
        Mat::zeros(rows, cols, CV_8UC3).unwrap().to_mat().unwrap()
    }

    #[test]
    fn test_combine_two_frames_side_by_side() {
        let combined = combine_frames(&[blank(40, 60), blank(40, 60)]).unwrap();
        assert_eq!(combined.cols(), 120);
        assert_eq!(combined.rows(), 40);
    }

    #[test]
    fn test_combine_odd_count_pads_last_row() {
        let combined = combine_frames(&[blank(40, 60), blank(40, 60), blank(40, 60)]).unwrap();
        assert_eq!(combined.cols(), 120);
        assert_eq!(combined.rows(), 80);
    }

    #[test]
    fn test_combine_normalizes_mismatched_geometry() {
        let combined = combine_frames(&[blank(40, 60), blank(20, 30)]).unwrap();
        assert_eq!(combined.cols(), 120);
        assert_eq!(combined.rows(), 40);
    }

    #[test]
    fn test_combine_rejects_empty_group() {
        assert!(combine_frames(&[]).is_err());
    }
}

/// Close the combined video writer once it has sat idle for a minute
fn spawn_sink_watcher(sink: Arc<Mutex<VideoSink>>, shutdown: ShutdownToken) {
    std::thread::spawn(move || {
        while shutdown.sleep(Duration::from_secs(5)) {
            let mut sink = sink.lock().unwrap_or_else(|e| e.into_inner());
            sink.close_if_idle(wall_clock_now());
        }
        // Release on shutdown as well
        let mut sink = sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.writer = None;
    });
}

/// Run the unification worker from a parsed stage config
pub fn run(config: &StageConfig, shutdown: ShutdownToken) -> Result<()> {
    let module: UnificationModuleConfig = config.module()?;

    let producer = Arc::new(MessageProducer::new(&config.bootstrap_servers)?);
    let mut runtime = StageRuntime::new(
        STAGE_UNIFICATION,
        &config.pipeline,
        &config.bootstrap_servers,
        ConsumerSettings::new(
            stage_topic(crate::config::STAGE_TRACKER, &config.pipeline),
            group_id(&config.pipeline, STAGE_UNIFICATION, "main"),
        ),
        producer,
        config.sync_config()?,
        shutdown.clone(),
    )?;

    let mut handler = UnificationHandler::new(
        &module.output,
        stage_topic(STAGE_UNIFICATION, &config.pipeline),
    )?;
    spawn_sink_watcher(handler.sink(), shutdown);

    runtime.run_groups(&mut handler)
}
