//! Broker producer with camera-affine partitioning

use crate::envelope::FrameEnvelope;
use crate::error::{PipelineError, Result};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
use serde::Serialize;
use std::time::Duration;

pub struct MessageProducer {
    producer: BaseProducer,
}

impl MessageProducer {
    pub fn new(bootstrap_servers: &[String]) -> Result<Self> {
        if bootstrap_servers.is_empty() {
            return Err(PipelineError::config(
                "bootstrap-servers must be a non-empty list",
            ));
        }

        let producer: BaseProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers.join(","))
            .set("message.max.bytes", "33554432")
            .set("queue.buffering.max.ms", "5")
            .create()
            .map_err(|e| PipelineError::broker(format!("producer creation failed: {e}")))?;

        Ok(Self { producer })
    }

    /// Send raw bytes. A `Some(key)` routes through the murmur2 partitioner,
    /// pinning equal keys to one partition; `None` round-robins.
    pub fn produce(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()> {
        let mut record: BaseRecord<'_, str, [u8]> = BaseRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        self.producer.send(record).map_err(|(err, _)| {
            PipelineError::broker(format!("produce to {topic} failed: {err}"))
        })?;

        // Serve delivery callbacks without blocking
        self.producer.poll(Duration::ZERO);
        log::debug!("produced message to {topic} (key={key:?})");
        Ok(())
    }

    /// Send a frame envelope keyed by its camera id
    pub fn produce_envelope(&self, topic: &str, envelope: &FrameEnvelope) -> Result<()> {
        let payload = envelope.to_bytes()?;
        self.produce(topic, Some(&envelope.camera_id), &payload)
    }

    /// Send a frame envelope without a key (round-robin partitioning);
    /// the unification and analytics outputs use this.
    pub fn produce_envelope_unkeyed(&self, topic: &str, envelope: &FrameEnvelope) -> Result<()> {
        let payload = envelope.to_bytes()?;
        self.produce(topic, None, &payload)
    }

    /// Send any serializable value as JSON
    pub fn produce_json<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.produce(topic, key, &payload)
    }

    /// Synchronously drain the send queue; called on shutdown with the
    /// 10-second bound from the concurrency model.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(timeout)
            .map_err(|e| PipelineError::broker(format!("producer flush failed: {e}")))
    }
}

impl Drop for MessageProducer {
    fn drop(&mut self) {
        if let Err(e) = self.producer.flush(Duration::from_secs(10)) {
            log::warn!("producer flush on drop failed: {e}");
        }
    }
}
