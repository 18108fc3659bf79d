//! Structured logging initialization.
//!
//! The socket core itself only emits `tracing` events; installing a
//! subscriber is left to the binary. This helper wires up the usual
//! `fmt` subscriber from a [`LoggingConfig`]. The `RUST_LOG` environment
//! variable takes precedence over the configured level.

use crate::config::{LogFormat, LoggingConfig};

use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Initialize the logging subsystem.
///
/// Fails if a global subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use relaynet::config::LoggingConfig;
///
/// relaynet::logging::init(&LoggingConfig::default())?;
/// tracing::info!("socket engine starting");
/// ```
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    tracing_subscriber::registry()
        .with(layer(config))
        .with(filter)
        .try_init()
}

fn layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = fmt::layer().with_target(config.target);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => base.pretty().boxed(),
        (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
    }
}
