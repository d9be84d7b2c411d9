//! Detection stage worker

use mcmot::config::StageConfig;
use mcmot::runtime::{install_signal_handler, ShutdownToken};

fn run(shutdown: ShutdownToken) -> mcmot::Result<()> {
    let config = StageConfig::from_args()?;
    mcmot::stages::detection::run(&config, shutdown)
}

fn main() {
    mcmot::logging::init();
    let shutdown = ShutdownToken::new();
    install_signal_handler(&shutdown);

    if let Err(e) = run(shutdown) {
        log::error!("detection worker failed: {e}");
        std::process::exit(e.exit_code());
    }
}
