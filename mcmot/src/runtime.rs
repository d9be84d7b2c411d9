//! Generic stage runtime
//!
//! Every stage worker is the same loop: consume, run the frame through the
//! sync engine when one is configured, hand it to the stage callback, produce
//! whatever comes back, commit. The loop honors the cooperative shutdown
//! token within two seconds at every blocking point.

use crate::config::dlq_topic;
use crate::envelope::FrameEnvelope;
use crate::error::{PipelineError, Result};
use crate::messaging::{ConsumerSettings, MessageConsumer, MessageProducer, PolledMessage, RetryLedger};
use crate::sync::{
    wall_clock_now, FrameSync, Sequencer, SyncConfig, SyncDecision, SyncGroup, SyncType,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_SLICE: Duration = Duration::from_millis(200);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cooperative shutdown flag shared across a worker's threads
#[derive(Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep in small slices, bailing early on shutdown. Returns false when
    /// the sleep was interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.is_triggered() {
                return false;
            }
            let slice = remaining.min(SHUTDOWN_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !self.is_triggered()
    }
}

/// Route ctrl-c / SIGTERM into the shutdown token
pub fn install_signal_handler(token: &ShutdownToken) {
    let token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        token.trigger();
    }) {
        log::warn!("could not install signal handler: {e}");
    }
}

/// One outbound message from a stage callback
pub struct Outbound {
    pub topic: String,
    pub key: Option<String>,
    pub envelope: FrameEnvelope,
}

impl Outbound {
    /// Keyed by the envelope's camera id (the default for frame traffic)
    pub fn keyed(topic: String, envelope: FrameEnvelope) -> Self {
        let key = Some(envelope.camera_id.clone());
        Self {
            topic,
            key,
            envelope,
        }
    }

    /// Unkeyed, for the unification/analytics outputs
    pub fn unkeyed(topic: String, envelope: FrameEnvelope) -> Self {
        Self {
            topic,
            key: None,
            envelope,
        }
    }
}

/// Per-frame stage callback
pub trait FrameHandler: Send {
    fn on_frame(&mut self, envelope: FrameEnvelope) -> Result<Vec<Outbound>>;

    /// Invoked when the sync engine decides to skip a frame; stages that
    /// predict through gaps override this.
    fn on_skipped(&mut self, _envelope: FrameEnvelope) -> Result<Vec<Outbound>> {
        Ok(Vec::new())
    }
}

/// Cross-camera group callback for unify-mode stages
pub trait GroupHandler: Send {
    fn on_group(&mut self, group: SyncGroup) -> Result<Vec<Outbound>>;
}

pub struct StageRuntime {
    stage: String,
    dlq: String,
    consumer: MessageConsumer,
    producer: Arc<MessageProducer>,
    sync: Option<FrameSync>,
    sync_settings: Option<SyncConfig>,
    sequencer: Option<Sequencer>,
    retries: RetryLedger,
    shutdown: ShutdownToken,
    warmed: bool,
    last_backlog_check: f64,
}

impl StageRuntime {
    pub fn new(
        stage: &str,
        pipeline: &str,
        bootstrap_servers: &[String],
        mut settings: ConsumerSettings,
        producer: Arc<MessageProducer>,
        sync_settings: Option<SyncConfig>,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        if let Some(sync) = &sync_settings {
            settings.start_at_latest = sync.ignore_initial_delay || sync.seek_to_end;
        }
        let consumer = MessageConsumer::new(bootstrap_servers, settings)?;

        let sync = match &sync_settings {
            Some(cfg) if cfg.sync_type.is_some() => Some(FrameSync::new(cfg.clone())?),
            _ => None,
        };

        let sequencer = sync_settings
            .as_ref()
            .filter(|cfg| cfg.enable_sequencing)
            .map(|cfg| Sequencer::new(cfg.backlog_check_interval, wall_clock_now()));

        let warmed = !sync_settings
            .as_ref()
            .map(|cfg| cfg.ignore_initial_delay)
            .unwrap_or(false);

        Ok(Self {
            stage: stage.to_string(),
            dlq: dlq_topic(stage, pipeline),
            consumer,
            producer,
            sync,
            sync_settings,
            sequencer,
            retries: RetryLedger::default(),
            shutdown,
            warmed,
            last_backlog_check: wall_clock_now(),
        })
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    fn seek_to_end_configured(&self) -> bool {
        self.sync_settings
            .as_ref()
            .map(|cfg| cfg.seek_to_end)
            .unwrap_or(false)
    }

    fn latency_threshold(&self) -> f64 {
        self.sync_settings
            .as_ref()
            .map(|cfg| cfg.latency_threshold)
            .unwrap_or(60.0)
    }

    fn backlog_interval(&self) -> f64 {
        self.sync_settings
            .as_ref()
            .map(|cfg| cfg.backlog_check_interval)
            .unwrap_or(0.0)
    }

    /// Sync key used for sequencing, mirroring the engine's keying
    fn sequencer_key(&self, envelope: &FrameEnvelope) -> i64 {
        let settings = self.sync_settings.as_ref();
        match settings.and_then(|cfg| cfg.sync_type) {
            Some(SyncType::Timestamp) => {
                let fps = settings
                    .map(|cfg| cfg.fps)
                    .filter(|f| *f > 0)
                    .unwrap_or(envelope.fps);
                if fps == 0 {
                    envelope.frame_number as i64
                } else {
                    (envelope.frame_timestamp * fps as f64).floor() as i64
                }
            }
            _ => envelope.frame_number as i64,
        }
    }

    /// Run a per-frame stage until shutdown
    pub fn run_frames(&mut self, handler: &mut dyn FrameHandler) -> Result<()> {
        log::info!("{} stage loop started", self.stage);

        while !self.shutdown.is_triggered() {
            self.flush_sequencer_if_due(handler);

            let Some(msg) = self.poll_tolerant()? else {
                continue;
            };

            let envelope = match FrameEnvelope::from_bytes(&msg.payload) {
                Ok(env) => env,
                Err(e) => {
                    // Undecodable payloads go straight to the dead letter
                    log::error!(
                        "{}: undecodable message at {}/{}: {e}",
                        self.stage,
                        msg.partition,
                        msg.offset
                    );
                    self.dead_letter(&msg)?;
                    self.consumer.commit(&msg)?;
                    continue;
                }
            };

            if !self.warmed {
                self.consumer.commit(&msg)?;
                self.consumer.seek_to_end()?;
                self.warmed = true;
                log::info!("{}: warmed up past the initial backlog", self.stage);
                continue;
            }

            if self.sequencer.is_some() {
                let key = self.sequencer_key(&envelope);
                if let Some(sequencer) = &mut self.sequencer {
                    sequencer.collect(key, envelope);
                }
                self.consumer.commit(&msg)?;
                continue;
            }

            match self.dispatch_frame(envelope, handler) {
                Ok(()) => {
                    self.consumer.commit(&msg)?;
                    self.retries.clear(msg.partition, msg.offset);
                    if self.seek_to_end_configured() {
                        self.consumer.seek_to_end()?;
                    }
                }
                Err(e) => {
                    log::error!(
                        "{}: callback failed at {}/{} (attempt {}): {e}",
                        self.stage,
                        msg.partition,
                        msg.offset,
                        self.retries.attempts(msg.partition, msg.offset) + 1
                    );
                    if self.retries.record_failure(msg.partition, msg.offset) {
                        self.dead_letter(&msg)?;
                        self.consumer.commit(&msg)?;
                        self.retries.clear(msg.partition, msg.offset);
                        self.consumer.poison_partition(msg.partition);
                    } else {
                        self.consumer.seek_back(&msg)?;
                    }
                }
            }
        }

        self.drain();
        Ok(())
    }

    /// Run a unify-mode stage until shutdown: deposit frames, emit groups on
    /// the backlog cadence.
    pub fn run_groups(&mut self, handler: &mut dyn GroupHandler) -> Result<()> {
        let unify = self
            .sync
            .as_ref()
            .map(|s| s.config().unify)
            .unwrap_or(false);
        if !unify {
            return Err(PipelineError::config(format!(
                "{} stage requires a frame-sync block with unify=true",
                self.stage
            )));
        }

        log::info!("{} group loop started", self.stage);

        while !self.shutdown.is_triggered() {
            self.flush_sequencer_into_sync();
            self.emit_groups_if_due(handler);

            let Some(msg) = self.poll_tolerant()? else {
                continue;
            };

            let envelope = match FrameEnvelope::from_bytes(&msg.payload) {
                Ok(env) => env,
                Err(e) => {
                    log::error!("{}: undecodable message: {e}", self.stage);
                    self.dead_letter(&msg)?;
                    self.consumer.commit(&msg)?;
                    continue;
                }
            };

            if !self.warmed {
                self.consumer.commit(&msg)?;
                self.consumer.seek_to_end()?;
                self.warmed = true;
                continue;
            }

            if self.sequencer.is_some() {
                // Reorder before deposit; the buffer drains on the next tick
                let key = self.sequencer_key(&envelope);
                if let Some(sequencer) = &mut self.sequencer {
                    sequencer.collect(key, envelope);
                }
            } else if let Some(sync) = &self.sync {
                sync.collect(&envelope);
            }
            self.consumer.commit(&msg)?;

            if self.seek_to_end_configured() {
                self.consumer.seek_to_end()?;
            }
        }

        // Final sweep so nothing complete is stranded in the buffer
        self.emit_groups(handler);
        self.drain();
        Ok(())
    }

    /// Poll, surfacing only hard failures; transient broker errors log and
    /// back off instead of killing the worker.
    fn poll_tolerant(&mut self) -> Result<Option<PolledMessage>> {
        match self.consumer.poll(POLL_TIMEOUT) {
            Ok(msg) => Ok(msg),
            Err(e) => {
                log::warn!("{}: transient broker error: {e}", self.stage);
                self.shutdown.sleep(Duration::from_secs(1));
                Ok(None)
            }
        }
    }

    fn dispatch_frame(
        &mut self,
        envelope: FrameEnvelope,
        handler: &mut dyn FrameHandler,
    ) -> Result<()> {
        if let Some(sync) = &self.sync {
            if !sync.config().unify {
                let decision = sync.skip_or_wait(
                    &envelope.camera_id,
                    envelope.frame_number,
                    envelope.frame_timestamp,
                    envelope.fps,
                );
                match decision {
                    SyncDecision::Skip => {
                        let outs = handler.on_skipped(envelope)?;
                        return self.produce_all(outs);
                    }
                    SyncDecision::Wait(wait) => {
                        let capped = wait.min(Duration::from_secs_f64(self.latency_threshold()));
                        self.shutdown.sleep(capped);
                    }
                    SyncDecision::Accept => {}
                }
            }
        }

        let outs = handler.on_frame(envelope)?;
        self.produce_all(outs)
    }

    fn produce_all(&self, outs: Vec<Outbound>) -> Result<()> {
        for out in outs {
            let payload = out.envelope.to_bytes()?;
            self.producer
                .produce(&out.topic, out.key.as_deref(), &payload)?;
        }
        Ok(())
    }

    fn dead_letter(&self, msg: &PolledMessage) -> Result<()> {
        self.producer
            .produce(&self.dlq, msg.key_str(), &msg.payload)?;
        log::warn!("{}: message moved to {}", self.stage, self.dlq);
        Ok(())
    }

    fn flush_sequencer_if_due(&mut self, handler: &mut dyn FrameHandler) {
        let now = wall_clock_now();
        let due = self
            .sequencer
            .as_ref()
            .map(|s| s.due(now) && !s.is_empty())
            .unwrap_or(false);
        if !due {
            return;
        }

        let drained = self
            .sequencer
            .as_mut()
            .map(|s| s.drain(now))
            .unwrap_or_default();
        for envelope in drained {
            // Already committed at collect time; failures here only log
            if let Err(e) = self.dispatch_frame(envelope, handler) {
                log::error!("{}: sequenced frame failed: {e}", self.stage);
            }
        }
    }

    /// Group-mode sequencing: release the reorder buffer into the sync
    /// engine in key order on the flush cadence.
    fn flush_sequencer_into_sync(&mut self) {
        let now = wall_clock_now();
        let due = self
            .sequencer
            .as_ref()
            .map(|s| s.due(now) && !s.is_empty())
            .unwrap_or(false);
        if !due {
            return;
        }

        let drained = self
            .sequencer
            .as_mut()
            .map(|s| s.drain(now))
            .unwrap_or_default();
        if let Some(sync) = &self.sync {
            for envelope in &drained {
                sync.collect(envelope);
            }
        }
    }

    fn emit_groups_if_due(&mut self, handler: &mut dyn GroupHandler) {
        let interval = self.backlog_interval();
        if interval <= 0.0 {
            return;
        }
        let now = wall_clock_now();
        if now - self.last_backlog_check < interval {
            return;
        }
        self.last_backlog_check = now;

        match self.consumer.backlog() {
            Ok(lag) => log::debug!("{}: consumer backlog {lag}", self.stage),
            Err(e) => log::debug!("{}: backlog probe failed: {e}", self.stage),
        }

        self.emit_groups(handler);
    }

    fn emit_groups(&mut self, handler: &mut dyn GroupHandler) {
        let Some(sync) = self.sync.take() else {
            return;
        };

        sync.synchronize(|group| {
            let key = group.sync_key;
            match handler.on_group(group) {
                Ok(outs) => {
                    if let Err(e) = self.produce_all(outs) {
                        log::error!("{}: producing group {key} failed: {e}", self.stage);
                    }
                }
                // Group callbacks never redeliver; the failure domain is the log
                Err(e) => log::error!("{}: group {key} failed: {e}", self.stage),
            }
        });

        self.sync = Some(sync);
    }

    /// Drain in-flight work and flush the producer on the way out
    fn drain(&mut self) {
        if let Err(e) = self.producer.flush(FLUSH_TIMEOUT) {
            log::warn!("{}: final flush failed: {e}", self.stage);
        }
        log::info!("{} stage loop stopped", self.stage);
    }
}
