//! Capture stage: video source reader driven by control signals
//!
//! The worker consumes the control topic and runs a state machine over
//! {INITIALIZED, RUNNING, STOPPED, ON_HOLD, ERROR}. START spawns the read
//! loop, which stamps each frame with `(camera_id, frame_number, timestamp,
//! fps)`, JPEG-encodes it, applies the intra-camera skip/wait policy, and
//! publishes keyed by camera id. On source loss the loop reconnects with
//! exponential backoff and resumes from the next available frame.

use crate::config::{control_topic, group_id, stage_topic, CaptureModuleConfig, StageConfig, STAGE_CAPTURE};
use crate::envelope::{
    CameraMetadata, ControlMessage, FrameEnvelope, FrameMetadata, ImagePayload, Signal,
};
use crate::error::{PipelineError, Result};
use crate::messaging::{ConsumerSettings, MessageConsumer, MessageProducer};
use crate::runtime::ShutdownToken;
use crate::sync::{wall_clock_now, FrameSync, SyncDecision};
use opencv::core::Vector;
use opencv::prelude::*;
use opencv::videoio::{VideoCapture, CAP_ANY};
use opencv::{imgcodecs, videoio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_RETRIES: u32 = 5;
const BACKOFF_START: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Operational state of the capture worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Initialized,
    Running,
    Stopped,
    OnHold,
    Error,
}

struct Shared {
    status: Mutex<Status>,
    shutdown: ShutdownToken,
}

impl Shared {
    fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: Status) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

/// Signal/state legality: START from a stopped-ish state, STOP and HOLD
/// only while producing, RESUME out of a hold (or an error, to retry).
fn signal_is_legal(status: Status, signal: Signal) -> bool {
    match signal {
        Signal::Start => matches!(status, Status::Initialized | Status::Stopped | Status::Error),
        Signal::Stop => matches!(status, Status::Running | Status::OnHold),
        Signal::Hold => status == Status::Running,
        Signal::Resume => matches!(status, Status::OnHold | Status::Error),
    }
}

/// Open the source, retrying, and seek to `start_frame`
fn connect(video_path: &str, retries: u32, start_frame: f64) -> Result<VideoCapture> {
    log::debug!("connecting to video source {video_path}");
    let mut backoff = BACKOFF_START;

    for attempt in 1..=retries {
        let mut cap = VideoCapture::from_file(video_path, CAP_ANY)?;
        if cap.is_opened()? {
            if start_frame > 0.0 {
                cap.set(videoio::CAP_PROP_POS_FRAMES, start_frame)?;
                log::info!("connected to {video_path}, seeking to frame {start_frame}");
            }
            return Ok(cap);
        }
        log::debug!("retry {attempt}/{retries} connecting to {video_path}");
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }

    Err(PipelineError::VideoSource(format!(
        "cannot open {video_path} after {retries} attempts"
    )))
}

pub struct CaptureService {
    consumer: MessageConsumer,
    producer: Arc<MessageProducer>,
    module: CaptureModuleConfig,
    outbound_topic: String,
    sync: Option<Arc<FrameSync>>,
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl CaptureService {
    pub fn new(config: &StageConfig, shutdown: ShutdownToken) -> Result<Self> {
        let module: CaptureModuleConfig = config.module()?;
        let sync = match config.sync_config()? {
            Some(cfg) if cfg.sync_type.is_some() => Some(Arc::new(FrameSync::new(cfg)?)),
            _ => None,
        };

        let consumer = MessageConsumer::new(
            &config.bootstrap_servers,
            ConsumerSettings::new(
                control_topic(&config.pipeline),
                group_id(&config.pipeline, STAGE_CAPTURE, &module.camera_id),
            ),
        )?;
        let producer = Arc::new(MessageProducer::new(&config.bootstrap_servers)?);

        Ok(Self {
            consumer,
            producer,
            module,
            outbound_topic: stage_topic(STAGE_CAPTURE, &config.pipeline),
            sync,
            shared: Arc::new(Shared {
                status: Mutex::new(Status::Initialized),
                shutdown,
            }),
            reader: None,
        })
    }

    /// Consume control signals until shutdown
    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "capture worker for camera {} awaiting signals",
            self.module.camera_id
        );

        while !self.shared.shutdown.is_triggered() {
            let msg = match self.consumer.poll(POLL_TIMEOUT) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("capture: transient broker error: {e}");
                    self.shared.shutdown.sleep(Duration::from_secs(1));
                    continue;
                }
            };

            match serde_json::from_slice::<ControlMessage>(&msg.payload) {
                Ok(control) => self.handle_signal(control),
                Err(e) => log::warn!("capture: unrecognized control message: {e}"),
            }
            self.consumer.commit(&msg)?;
        }

        // Cooperative shutdown: stop the reader, flush, exit 0
        self.shared.set_status(Status::Stopped);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.producer.flush(Duration::from_secs(10))?;
        log::info!("capture worker stopped");
        Ok(())
    }

    fn handle_signal(&mut self, control: ControlMessage) {
        let status = self.shared.status();
        log::info!("capture received {:?} in state {status:?}", control.signal);

        if !signal_is_legal(status, control.signal) {
            log::warn!("illegal {:?} in state {status:?}, ignored", control.signal);
            return;
        }

        match control.signal {
            Signal::Start => self.spawn_reader(control.loop_count),
            Signal::Stop => {
                self.shared.set_status(Status::Stopped);
                if let Some(reader) = self.reader.take() {
                    let _ = reader.join();
                }
                // STOP drains and exits the worker, not just the read loop
                self.shared.shutdown.trigger();
            }
            Signal::Hold => self.shared.set_status(Status::OnHold),
            Signal::Resume => self.shared.set_status(Status::Running),
        }
    }

    fn spawn_reader(&mut self, loop_count: u32) {
        let shared = Arc::clone(&self.shared);
        let producer = Arc::clone(&self.producer);
        let sync = self.sync.clone();
        let module = self.module.clone();
        let topic = self.outbound_topic.clone();

        self.shared.set_status(Status::Running);
        self.reader = Some(std::thread::spawn(move || {
            if let Err(e) = read_loop(&shared, &producer, sync.as_deref(), &module, &topic, loop_count)
            {
                log::error!("capture read loop failed: {e}");
                shared.set_status(Status::Error);
            }
        }));
    }
}

/// The frame production loop, running until STOP, shutdown, or loop
/// exhaustion.
fn read_loop(
    shared: &Shared,
    producer: &MessageProducer,
    sync: Option<&FrameSync>,
    module: &CaptureModuleConfig,
    topic: &str,
    loop_count: u32,
) -> Result<()> {
    let video_path = module.video_path();
    let mut cap = connect(&video_path, CONNECT_RETRIES, 0.0)?;

    let camera_metadata = CameraMetadata {
        location: module.location.clone(),
        format: Some(module.format.clone()),
        compression: Some(module.compression.clone()),
        bitrate: Some(module.bitrate.clone()),
        encoding: Some(module.encoding.clone()),
    };

    let mut fps = 0u32;
    let mut simulated_offset = 0u64;
    let mut loops_done = 0u32;
    let mut produced = 0u64;
    let start_time = wall_clock_now();
    let total_frames = cap.get(videoio::CAP_PROP_FRAME_COUNT)?.max(0.0);
    let codec = cap.get(videoio::CAP_PROP_FOURCC)?;

    let mut frame = Mat::default();
    loop {
        if shared.shutdown.is_triggered() || shared.status() == Status::Stopped {
            break;
        }
        while shared.status() == Status::OnHold {
            if !shared.shutdown.sleep(Duration::from_millis(100)) {
                return Ok(());
            }
        }

        if !cap.read(&mut frame)? || frame.empty() {
            let resume_from = cap.get(videoio::CAP_PROP_POS_FRAMES)?;
            log::debug!("stream lost, reconnecting from frame {resume_from}");
            cap = connect(&video_path, CONNECT_RETRIES, resume_from)?;
            continue;
        }

        let source_frame = cap.get(videoio::CAP_PROP_POS_FRAMES)? as u64;
        let frame_number = source_frame + simulated_offset;
        let frame_timestamp = wall_clock_now();
        if fps == 0 {
            fps = cap.get(videoio::CAP_PROP_FPS)?.round() as u32;
        }

        // Intra-camera admission: drop to catch up, or pace to source fps
        if let Some(sync) = sync {
            match sync.skip_or_wait(&module.camera_id, frame_number, frame_timestamp, fps) {
                SyncDecision::Skip => {
                    log::debug!(
                        "camera {}: dropping frame {frame_number} under pressure",
                        module.camera_id
                    );
                    continue;
                }
                SyncDecision::Wait(wait) => {
                    if !shared.shutdown.sleep(wait) {
                        return Ok(());
                    }
                }
                SyncDecision::Accept => {}
            }
        }

        let mut jpeg = Vector::<u8>::new();
        imgcodecs::imencode(".jpg", &frame, &mut jpeg, &Vector::new())?;

        let elapsed = wall_clock_now() - start_time;
        let actual_fps = if elapsed > 0.0 {
            (produced as f64 / elapsed).ceil() as u32
        } else {
            0
        };

        let envelope = FrameEnvelope {
            camera_id: module.camera_id.clone(),
            frame_number,
            frame_timestamp,
            fps,
            image: ImagePayload::from_jpeg(jpeg.as_slice(), frame.cols() as u32, frame.rows() as u32),
            metadata: FrameMetadata {
                width: Some(frame.cols() as u32),
                height: Some(frame.rows() as u32),
                codec: Some(format!("{codec}")),
                actual_fps: Some(actual_fps),
                ..FrameMetadata::default()
            },
            camera_metadata: camera_metadata.clone(),
        };

        producer.produce_envelope(topic, &envelope)?;
        produced += 1;

        // Replay handling: keep frame numbers strictly increasing across loops
        if total_frames > 0.0 && source_frame as f64 >= total_frames {
            simulated_offset += source_frame;
            loops_done += 1;
            if loops_done >= loop_count {
                log::info!(
                    "camera {}: {loop_count} loop(s) done, {} frames produced",
                    module.camera_id,
                    produced
                );
                break;
            }
            cap = connect(&video_path, CONNECT_RETRIES, 0.0)?;
        }
    }

    shared.set_status(Status::Stopped);
    Ok(())
}

/// Run the capture worker from a parsed stage config
pub fn run(config: &StageConfig, shutdown: ShutdownToken) -> Result<()> {
    let mut service = CaptureService::new(config, shutdown)?;
    service.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_only_from_idle_states() {
        assert!(signal_is_legal(Status::Initialized, Signal::Start));
        assert!(signal_is_legal(Status::Stopped, Signal::Start));
        assert!(signal_is_legal(Status::Error, Signal::Start));
        assert!(!signal_is_legal(Status::Running, Signal::Start));
        assert!(!signal_is_legal(Status::OnHold, Signal::Start));
    }

    #[test]
    fn test_hold_resume_pairing() {
        assert!(signal_is_legal(Status::Running, Signal::Hold));
        assert!(!signal_is_legal(Status::OnHold, Signal::Hold));
        assert!(signal_is_legal(Status::OnHold, Signal::Resume));
        assert!(!signal_is_legal(Status::Running, Signal::Resume));
    }

    #[test]
    fn test_stop_requires_activity() {
        assert!(signal_is_legal(Status::Running, Signal::Stop));
        assert!(signal_is_legal(Status::OnHold, Signal::Stop));
        assert!(!signal_is_legal(Status::Initialized, Signal::Stop));
        assert!(!signal_is_legal(Status::Stopped, Signal::Stop));
    }

    #[test]
    fn test_video_path_layout() {
        let module: CaptureModuleConfig = serde_json::from_value(serde_json::json!({
            "camera-id": "cam-3",
            "location": "garage",
        }))
        .unwrap();
        assert_eq!(module.video_path(), "capture/video/garage/garage-cam-3.avi");

        let explicit: CaptureModuleConfig = serde_json::from_value(serde_json::json!({
            "camera-id": "cam-3",
            "video": "rtsp://host/stream",
        }))
        .unwrap();
        assert_eq!(explicit.video_path(), "rtsp://host/stream");
    }
}
