//! Topic setup for one pipeline

use mcmot::config::{from_value, read_config_arg, SetupConfig};

fn run() -> mcmot::Result<()> {
    let config: SetupConfig = from_value(read_config_arg()?)?;
    mcmot::control::run_setup(&config)
}

fn main() {
    mcmot::logging::init();
    if let Err(e) = run() {
        log::error!("setup failed: {e}");
        std::process::exit(e.exit_code());
    }
}
