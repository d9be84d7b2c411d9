//! Logging setup for stage workers
//!
//! Workers log through the `log` facade; the fleet supervisor redirects each
//! worker's stderr to `logs/<stage>-<i>.log`, so the stderr writer here is
//! all a worker needs.

use std::io::Write;

/// Initialize env_logger once per process.
///
/// `RUST_LOG` overrides the default `info` level; the format carries a
/// millisecond timestamp, level, and target so interleaved stage logs stay
/// attributable.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
