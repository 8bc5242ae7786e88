//! Unified error handling for Heliotherm
//!
//! This crate provides a single error type used across all Heliotherm components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using HeliothermError
pub type Result<T> = std::result::Result<T, HeliothermError>;

/// Unified error type for all Heliotherm operations
#[derive(thiserror::Error, Debug)]
pub enum HeliothermError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Sensor Access Errors
    // ============================================================================
    #[error("Failed to read sensor {sensor}: {reason}")]
    SensorRead {
        sensor: String,
        reason: String,
    },

    #[error("Sensor {sensor} reported implausible value {value}°C")]
    SensorOutOfRange {
        sensor: String,
        value: f64,
    },

    #[error("Unknown sensor: {0}")]
    UnknownSensor(String),

    // ============================================================================
    // Configuration and Settings Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Daemon and IPC Errors
    // ============================================================================
    #[error("Control loop not available")]
    ControlLoopUnavailable,

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl HeliothermError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid configuration error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a sensor read error
    pub fn sensor_read(sensor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SensorRead {
            sensor: sensor.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for HeliothermError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for HeliothermError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
