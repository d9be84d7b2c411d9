//! Broker consumer with manual commits, redelivery and dead-lettering

use crate::error::{PipelineError, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Deliveries after which a message moves to the dead-letter topic
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

const WATERMARK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub topic: String,
    pub group_id: String,
    /// Only process messages whose partition key equals this camera id
    pub key_filter: Option<String>,
    /// Start from the newest offset instead of the earliest
    pub start_at_latest: bool,
}

impl ConsumerSettings {
    pub fn new(topic: String, group_id: String) -> Self {
        Self {
            topic,
            group_id,
            key_filter: None,
            start_at_latest: false,
        }
    }
}

/// An owned copy of one delivered message
#[derive(Debug, Clone)]
pub struct PolledMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl PolledMessage {
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }
}

/// Per-offset failure bookkeeping for the at-most-once-commit rule
#[derive(Default)]
pub struct RetryLedger {
    attempts: HashMap<(i32, i64), u32>,
}

impl RetryLedger {
    /// Record a failed delivery; returns true once the message has used up
    /// its deliveries and must be dead-lettered.
    pub fn record_failure(&mut self, partition: i32, offset: i64) -> bool {
        let count = self.attempts.entry((partition, offset)).or_insert(0);
        *count += 1;
        *count >= MAX_DELIVERY_ATTEMPTS
    }

    pub fn clear(&mut self, partition: i32, offset: i64) {
        self.attempts.remove(&(partition, offset));
    }

    pub fn attempts(&self, partition: i32, offset: i64) -> u32 {
        self.attempts.get(&(partition, offset)).copied().unwrap_or(0)
    }
}

pub struct MessageConsumer {
    consumer: BaseConsumer,
    topic: String,
    key_filter: Option<String>,
    poisoned_partitions: HashSet<i32>,
}

impl MessageConsumer {
    pub fn new(bootstrap_servers: &[String], settings: ConsumerSettings) -> Result<Self> {
        if bootstrap_servers.is_empty() {
            return Err(PipelineError::config(
                "bootstrap-servers must be a non-empty list",
            ));
        }

        let offset_reset = if settings.start_at_latest {
            "latest"
        } else {
            "earliest"
        };

        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers.join(","))
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .set("fetch.message.max.bytes", "33554432")
            .create()
            .map_err(|e| PipelineError::broker(format!("consumer creation failed: {e}")))?;

        consumer
            .subscribe(&[settings.topic.as_str()])
            .map_err(|e| PipelineError::broker(format!("subscribe failed: {e}")))?;

        log::info!(
            "consumer group '{}' subscribed to '{}' (reset={offset_reset})",
            settings.group_id,
            settings.topic
        );

        Ok(Self {
            consumer,
            topic: settings.topic,
            key_filter: settings.key_filter,
            poisoned_partitions: HashSet::new(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Poll one message. `None` covers both "nothing arrived within the
    /// timeout" and messages committed away by the key filter.
    pub fn poll(&self, timeout: Duration) -> Result<Option<PolledMessage>> {
        let Some(delivery) = self.consumer.poll(timeout) else {
            return Ok(None);
        };
        let msg = delivery.map_err(|e| PipelineError::broker(format!("poll failed: {e}")))?;

        let polled = PolledMessage {
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
        };

        if let Some(expected) = &self.key_filter {
            let matches = polled.key_str().map(|k| k == expected).unwrap_or(false);
            if !matches {
                self.commit(&polled)?;
                return Ok(None);
            }
        }

        Ok(Some(polled))
    }

    /// Commit the offset right after this message
    pub fn commit(&self, msg: &PolledMessage) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, msg.partition, Offset::Offset(msg.offset + 1))
            .map_err(|e| PipelineError::broker(format!("commit list build failed: {e}")))?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| PipelineError::broker(format!("commit failed: {e}")))
    }

    /// Rewind the partition so this message redelivers on the next poll
    pub fn seek_back(&self, msg: &PolledMessage) -> Result<()> {
        self.consumer
            .seek(
                &self.topic,
                msg.partition,
                Offset::Offset(msg.offset),
                WATERMARK_TIMEOUT,
            )
            .map_err(|e| PipelineError::broker(format!("seek failed: {e}")))
    }

    /// Jump every assigned partition to its end offset, abandoning the
    /// backlog. Used by seek-to-end mode and the warm-up path.
    pub fn seek_to_end(&self) -> Result<()> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| PipelineError::broker(format!("assignment fetch failed: {e}")))?;

        for elem in assignment.elements() {
            self.consumer
                .seek(elem.topic(), elem.partition(), Offset::End, WATERMARK_TIMEOUT)
                .map_err(|e| {
                    PipelineError::broker(format!(
                        "seek to end of {}[{}] failed: {e}",
                        elem.topic(),
                        elem.partition()
                    ))
                })?;
        }
        log::debug!("consumer sought to end of {}", self.topic);
        Ok(())
    }

    /// Unconsumed message count across the assignment: Σ(high - position)
    pub fn backlog(&self) -> Result<i64> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| PipelineError::broker(format!("assignment fetch failed: {e}")))?;
        let positions = self
            .consumer
            .position()
            .map_err(|e| PipelineError::broker(format!("position fetch failed: {e}")))?;

        let mut backlog = 0i64;
        for elem in assignment.elements() {
            let (_, high) = self
                .consumer
                .fetch_watermarks(elem.topic(), elem.partition(), WATERMARK_TIMEOUT)
                .map_err(|e| PipelineError::broker(format!("watermark fetch failed: {e}")))?;

            let position = positions
                .find_partition(elem.topic(), elem.partition())
                .and_then(|p| p.offset().to_raw())
                .unwrap_or(0);

            backlog += (high - position).max(0);
        }
        Ok(backlog)
    }

    /// Mark a partition as poisoned after dead-lettering. The worker keeps
    /// consuming; the flag only silences repeat diagnostics.
    pub fn poison_partition(&mut self, partition: i32) {
        if self.poisoned_partitions.insert(partition) {
            log::warn!(
                "partition {partition} of '{}' marked poisoned, continuing",
                self.topic
            );
        }
    }

    pub fn is_poisoned(&self, partition: i32) -> bool {
        self.poisoned_partitions.contains(&partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_ledger_counts_to_dead_letter() {
        let mut ledger = RetryLedger::default();
        assert!(!ledger.record_failure(0, 42));
        assert!(!ledger.record_failure(0, 42));
        assert!(ledger.record_failure(0, 42));
        assert_eq!(ledger.attempts(0, 42), 3);

        ledger.clear(0, 42);
        assert_eq!(ledger.attempts(0, 42), 0);
    }

    #[test]
    fn test_retry_ledger_isolates_offsets() {
        let mut ledger = RetryLedger::default();
        ledger.record_failure(0, 1);
        ledger.record_failure(1, 1);
        assert_eq!(ledger.attempts(0, 1), 1);
        assert_eq!(ledger.attempts(1, 1), 1);
        assert_eq!(ledger.attempts(0, 2), 0);
    }

    #[test]
    fn test_polled_message_key_str() {
        let msg = PolledMessage {
            partition: 0,
            offset: 7,
            key: Some(b"cam-1".to_vec()),
            payload: Vec::new(),
        };
        assert_eq!(msg.key_str(), Some("cam-1"));
    }
}
