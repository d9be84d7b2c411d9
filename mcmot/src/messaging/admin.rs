//! Topic administration for pipeline setup

use crate::error::{PipelineError, Result};
use futures::executor::block_on;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use std::time::{Duration, Instant};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TopicAdmin {
    admin: AdminClient<DefaultClientContext>,
    /// Plain consumer handle used for metadata queries
    metadata_client: BaseConsumer,
}

impl TopicAdmin {
    pub fn new(bootstrap_servers: &[String]) -> Result<Self> {
        let servers = bootstrap_servers.join(",");
        let admin = ClientConfig::new()
            .set("bootstrap.servers", &servers)
            .create()
            .map_err(|e| PipelineError::broker(format!("admin client creation failed: {e}")))?;
        let metadata_client: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &servers)
            .set("group.id", "mcmot-admin-metadata")
            .create()
            .map_err(|e| PipelineError::broker(format!("metadata client creation failed: {e}")))?;

        Ok(Self {
            admin,
            metadata_client,
        })
    }

    pub fn topic_exists(&self, name: &str) -> Result<bool> {
        let metadata = self
            .metadata_client
            .fetch_metadata(Some(name), METADATA_TIMEOUT)
            .map_err(|e| PipelineError::broker(format!("metadata fetch failed: {e}")))?;

        Ok(metadata
            .topics()
            .iter()
            .any(|t| t.name() == name && t.error().is_none() && !t.partitions().is_empty()))
    }

    /// Partition count of an existing topic, 0 when absent
    pub fn partition_count(&self, name: &str) -> Result<usize> {
        let metadata = self
            .metadata_client
            .fetch_metadata(Some(name), METADATA_TIMEOUT)
            .map_err(|e| PipelineError::broker(format!("metadata fetch failed: {e}")))?;

        Ok(metadata
            .topics()
            .iter()
            .find(|t| t.name() == name)
            .map_or(0, |t| t.partitions().len()))
    }

    /// Create a topic, optionally deleting an existing one first so the
    /// pipeline starts from clean offsets.
    pub fn create_topic(
        &self,
        name: &str,
        partitions: i32,
        replication: i32,
        recreate: bool,
    ) -> Result<()> {
        if self.topic_exists(name)? {
            if !recreate {
                log::info!("topic '{name}' already exists, skipping creation");
                return Ok(());
            }
            self.delete_topic(name)?;
        }

        let topic = NewTopic::new(name, partitions, TopicReplication::Fixed(replication));
        let results = block_on(self.admin.create_topics([&topic], &AdminOptions::new()))
            .map_err(|e| PipelineError::broker(format!("create_topics failed: {e}")))?;

        for result in results {
            match result {
                Ok(_) => {}
                // Lost the race against another setup run; the topic is there
                Err((_, rdkafka::types::RDKafkaErrorCode::TopicAlreadyExists)) => {
                    log::info!("topic '{name}' already exists");
                    return Ok(());
                }
                Err((topic, code)) => {
                    return Err(PipelineError::broker(format!(
                        "creating topic '{topic}' failed: {code}"
                    )));
                }
            }
        }

        self.wait_until(name, true)?;
        log::info!("topic '{name}' created with {partitions} partition(s)");
        Ok(())
    }

    pub fn delete_topic(&self, name: &str) -> Result<()> {
        let results = block_on(self.admin.delete_topics(&[name], &AdminOptions::new()))
            .map_err(|e| PipelineError::broker(format!("delete_topics failed: {e}")))?;

        for result in results {
            match result {
                Ok(_) | Err((_, rdkafka::types::RDKafkaErrorCode::UnknownTopicOrPartition)) => {}
                Err((topic, code)) => {
                    return Err(PipelineError::broker(format!(
                        "deleting topic '{topic}' failed: {code}"
                    )));
                }
            }
        }

        self.wait_until(name, false)?;
        log::info!("topic '{name}' deleted");
        Ok(())
    }

    /// Poll metadata until the topic reaches the wanted existence state
    fn wait_until(&self, name: &str, should_exist: bool) -> Result<()> {
        let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
        loop {
            if self.topic_exists(name)? == should_exist {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(PipelineError::broker(format!(
                    "topic '{name}' did not converge to exists={should_exist} in {:?}",
                    CONVERGENCE_TIMEOUT
                )));
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}
