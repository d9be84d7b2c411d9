//! Fleet starter: spawn the pipeline's stage workers

use mcmot::config::{from_value, read_config_arg, FleetEntry};

fn run() -> mcmot::Result<()> {
    let entries: Vec<FleetEntry> = from_value(read_config_arg()?)?;
    mcmot::control::start_fleet(&entries)
}

fn main() {
    mcmot::logging::init();
    if let Err(e) = run() {
        log::error!("fleet start failed: {e}");
        std::process::exit(e.exit_code());
    }
}
