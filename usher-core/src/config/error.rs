//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// A single value (usually from the environment) could not be interpreted
    #[error("invalid {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, message: impl ToString) -> Self {
        ConfigError::InvalidValue {
            key,
            message: message.to_string(),
        }
    }
}
