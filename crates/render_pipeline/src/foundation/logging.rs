//! Logging setup for the pipeline
//!
//! The crate logs through the `log` facade. Pipeline messages use the
//! [`TARGET`] target so they can be filtered with
//! `RUST_LOG=renderer=trace`.

pub use log::{debug, error, info, trace, warn};

use crate::core::LoggingConfig;

/// Log target used by every pipeline component
pub const TARGET: &str = "renderer";

/// Initialize the logging system
///
/// Uses `config.level` as the default filter unless `RUST_LOG` is set.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init(config: &LoggingConfig) {
    let env = env_logger::Env::default().default_filter_or(config.level.as_str());
    if env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init()
        .is_err()
    {
        log::trace!(target: TARGET, "Logger already initialized");
    }
}
