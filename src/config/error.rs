//! Error types for configuration parsing and validation.

use std::path::PathBuf;

use thiserror::Error;

/// Error type for configuration operations.
///
/// Covers errors from parsing, validation, and file operations. Every
/// variant is fatal: the process exits before the poll loop starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        /// Path to the config file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to write configuration file (for init command).
    #[error("Failed to write config file '{}': {source}", path.display())]
    FileWrite {
        /// Path to the config file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A value is malformed or out of range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Dotted key of the offending field
        field: String,
        /// Reason for invalidity
        reason: String,
    },

    /// An environment override could not be applied.
    #[error("Invalid environment override {var}: {reason}")]
    InvalidEnv {
        /// Variable name
        var: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Invalid URL provided.
    #[error("Invalid URL '{url}' for {field}: {reason}")]
    InvalidUrl {
        /// Dotted key of the offending field
        field: String,
        /// The invalid URL string
        url: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Invalid detector configuration.
    #[error("Invalid detector configuration: {0}")]
    InvalidDetectors(String),

    /// Invalid route.
    #[error("Invalid notifier.routes[{index}]: {reason}")]
    InvalidRoute {
        /// Position in the route list
        index: usize,
        /// Reason for invalidity
        reason: String,
    },

    /// Invalid sink.
    #[error("Invalid notifier.sinks[{index}]: {reason}")]
    InvalidSink {
        /// Position in the sink list
        index: usize,
        /// Reason for invalidity
        reason: String,
    },

    /// Invalid retry configuration.
    #[error("Invalid retry configuration: {0}")]
    InvalidRetry(String),
}

impl ConfigError {
    /// Creates an `InvalidValue` error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// A short suggestion printed after the error, if one applies.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        match self {
            Self::FileRead { .. } | Self::TomlParse(_) => {
                Some("Run 'sentinel init' to generate a configuration template.")
            }
            Self::InvalidUrl { .. } => {
                Some("Check that every ${VAR} placeholder in sink URLs is set in the environment.")
            }
            Self::InvalidRoute { .. } | Self::InvalidSink { .. } => {
                Some("Routes may only name sinks declared under [[notifier.sinks]].")
            }
            Self::InvalidDetectors(_) => {
                Some("Known detectors are: presence, peer_changes, runtime.")
            }
            _ => None,
        }
    }
}
