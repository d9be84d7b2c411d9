//! Send a control signal to a pipeline's capture workers

use mcmot::config::{control_topic, from_value, read_config_arg, SignalConfig};
use mcmot::envelope::ControlMessage;
use mcmot::messaging::MessageProducer;
use std::time::Duration;

fn run() -> mcmot::Result<()> {
    let config: SignalConfig = from_value(read_config_arg()?)?;
    let topic = control_topic(&config.pipeline);
    let message = ControlMessage {
        pipeline: config.pipeline.clone(),
        signal: config.signal,
        loop_count: config.loop_count,
    };

    let producer = MessageProducer::new(&config.bootstrap_servers)?;
    producer.produce_json(&topic, None, &message)?;
    producer.flush(Duration::from_secs(10))?;

    log::info!("signal {:?} sent to '{topic}'", config.signal);
    Ok(())
}

fn main() {
    mcmot::logging::init();
    if let Err(e) = run() {
        log::error!("signal send failed: {e}");
        std::process::exit(e.exit_code());
    }
}
