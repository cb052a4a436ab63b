use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration-specific errors
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(String),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Failures of the durable store behind the transmission buffer.
///
/// None of these are fatal: the buffer logs them and keeps its in-memory
/// queue authoritative.
#[derive(Error, Diagnostic, Debug)]
pub enum StorageError {
    #[error("Failed to open buffer store at {path}")]
    #[diagnostic(
        code(aether_core::storage_open),
        help("Check that the directory is writable and not locked by another process")
    )]
    Open {
        path: String,
        #[source]
        cause: sled::Error,
    },

    #[error("Failed to {operation} buffer record '{key}'")]
    #[diagnostic(code(aether_core::storage_io))]
    Io {
        operation: &'static str,
        key: String,
        #[source]
        cause: sled::Error,
    },

    #[error("Buffer record '{key}' is corrupt")]
    #[diagnostic(
        code(aether_core::storage_corrupt),
        help("The record will be treated as empty and overwritten on the next write")
    )]
    Corrupt {
        key: String,
        #[source]
        cause: serde_json::Error,
    },
}

/// Event channel faults. Callers recover by buffering.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel is not connected")]
    #[diagnostic(code(aether_core::channel_not_connected))]
    NotConnected,

    #[error("Channel closed: {0}")]
    #[diagnostic(code(aether_core::channel_closed))]
    Closed(String),
}

/// Geolocation source faults, surfaced as notices.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorError {
    #[error("Location permission denied")]
    #[diagnostic(
        code(aether_core::sensor_permission),
        help("Grant location access to the application")
    )]
    PermissionDenied,

    #[error("Location request timed out")]
    #[diagnostic(code(aether_core::sensor_timeout))]
    Timeout,

    #[error("Location unavailable: {0}")]
    #[diagnostic(code(aether_core::sensor_unavailable))]
    Unavailable(String),
}

/// Geocoding and routing lookup failures.
#[derive(Error, Diagnostic, Debug)]
pub enum LookupError {
    #[cfg(feature = "http")]
    #[error("HTTP request to {service} failed")]
    #[diagnostic(
        code(aether_core::lookup_http),
        help("Check network connectivity and the configured service URL")
    )]
    Http {
        service: &'static str,
        #[source]
        cause: reqwest::Error,
    },

    #[error("Unexpected response from {service}: {details}")]
    #[diagnostic(code(aether_core::lookup_decode))]
    Decode {
        service: &'static str,
        details: String,
    },

    #[error("No route found")]
    #[diagnostic(code(aether_core::lookup_no_route))]
    NoRoute,
}

#[derive(Error, Diagnostic, Debug)]
pub enum CoreError {
    #[error("Configuration error for field '{field}'")]
    #[diagnostic(
        code(aether_core::configuration_error),
        help("Check configuration file at {config_path}\nExpected: {expected}")
    )]
    ConfigurationError {
        config_path: String,
        field: String,
        expected: String,
        #[source]
        cause: ConfigError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lookup(#[from] LookupError),

    #[error("Tracker task is no longer running")]
    #[diagnostic(
        code(aether_core::tracker_stopped),
        help("The session was shut down; spawn a new tracker")
    )]
    TrackerStopped,
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn config(
        config_path: impl Into<String>,
        field: impl Into<String>,
        expected: impl Into<String>,
        cause: ConfigError,
    ) -> Self {
        Self::ConfigurationError {
            config_path: config_path.into(),
            field: field.into(),
            expected: expected.into(),
            cause,
        }
    }
}
