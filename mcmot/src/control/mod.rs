//! Control plane: topic setup and worker fleet supervision

mod fleet;
mod setup;

pub use fleet::{start_fleet, stop_fleet};
pub use setup::run_setup;
