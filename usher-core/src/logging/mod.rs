//! Logging subsystem for Usher
//!
//! Installs the global `tracing` subscriber from the `[logging]` config
//! section. Components log with structured fields (`tier`, `recipient`,
//! `key`); audit records go to the invite log, not here. `RUST_LOG`
//! overrides the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the subscriber described by `settings`
///
/// # Example
/// ```
/// use usher_core::config::LoggingConfig;
/// use usher_core::logging::init_logging;
///
/// let mut settings = LoggingConfig::default();
/// settings.level = "debug".to_string();
/// settings.with_target = false;
///
/// init_logging(&settings).expect("logging init failed");
/// ```
pub fn init_logging(settings: &LoggingConfig) -> Result<(), LoggingError> {
    let level: LogLevel = settings.level.parse()?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::registry()
        .with(output_layer(settings))
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}

fn output_layer(settings: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer().with_target(settings.with_target);
    match (settings.json_format, settings.with_timestamp) {
        (true, true) => layer.json().boxed(),
        (true, false) => layer.json().without_time().boxed(),
        (false, true) => layer.boxed(),
        (false, false) => layer.without_time().boxed(),
    }
}
