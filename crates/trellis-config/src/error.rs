use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while assembling the debug configuration from its
/// `debug.toml` layers.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A debug config named on the command line does not exist.
    #[error("debug config {0} does not exist")]
    NotFound(PathBuf),

    /// The commented `debug.toml` template could not be written.
    #[error("cannot write debug.toml template: {0}")]
    CreateDefault(String),

    /// A layer is not valid TOML or does not fit the debug config schema.
    #[error("malformed debug config: {0}")]
    Parse(String),

    /// A config value failed validation.
    #[error("invalid debug config: {field} {message}")]
    Validation {
        /// The dotted field path (e.g. `session.request_timeout_secs`).
        field: String,
        /// Human-readable description of the violation.
        message: String,
    },

    /// Reading a layer or creating the config directory failed.
    #[error("debug config I/O: {0}")]
    Io(#[from] std::io::Error),
}
