//! Structured logging setup, configured from the `log` section of the
//! configuration document: an `EnvFilter` seeded from the configured level,
//! a `tracing-subscriber` formatting layer switched between human-readable
//! and JSON output.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Installs the global `tracing` subscriber. Must be called exactly once,
/// before any other part of the application logs.
pub fn init(config: &LogConfig) {
    let env_filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json_log_format {
        let formatting_layer = fmt::layer().with_target(true).json();
        tracing_subscriber::registry().with(env_filter).with(formatting_layer).init();
    } else {
        let formatting_layer = fmt::layer().with_target(true);
        tracing_subscriber::registry().with(env_filter).with(formatting_layer).init();
    }
}
