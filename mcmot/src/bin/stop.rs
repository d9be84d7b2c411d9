//! Fleet stopper: terminate workers tracked by PID files

use std::path::Path;

fn main() {
    mcmot::logging::init();
    if let Err(e) = mcmot::control::stop_fleet(Path::new("pids")) {
        log::error!("fleet stop failed: {e}");
        std::process::exit(e.exit_code());
    }
}
