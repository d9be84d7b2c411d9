//! Pipeline topic setup
//!
//! Recreates the per-stage topics for one pipeline from a declared
//! `{stage -> partitions}` map, plus the capture control topic. Existing
//! topics are deleted first so a fresh run starts from clean offsets.

use crate::config::{control_topic, stage_topic, SetupConfig, STAGES};
use crate::error::Result;
use crate::messaging::TopicAdmin;

pub fn run_setup(config: &SetupConfig) -> Result<()> {
    let admin = TopicAdmin::new(&config.bootstrap_servers)?;

    let mut topics: Vec<(String, i32)> = STAGES
        .iter()
        .map(|stage| {
            let partitions = config.topics.get(*stage).copied().unwrap_or(1).max(1);
            (stage_topic(stage, &config.pipeline), partitions)
        })
        .collect();
    // The control topic carries only signals; one partition is plenty
    topics.push((control_topic(&config.pipeline), 1));

    log::info!(
        "setting up {} topic(s) for pipeline '{}'",
        topics.len(),
        config.pipeline
    );

    for (name, partitions) in topics {
        admin.create_topic(&name, partitions, 1, true)?;
    }
    Ok(())
}
