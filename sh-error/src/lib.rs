//! Unified error handling for Shop Heater
//!
//! This crate provides a single error type used across all Shop Heater components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using ShopHeaterError
pub type Result<T> = std::result::Result<T, ShopHeaterError>;

/// Unified error type for all Shop Heater operations
#[derive(thiserror::Error, Debug)]
pub enum ShopHeaterError {
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
    // Hardware Errors
    // ============================================================================
    /// Fatal: the owning component cannot start without this resource
    #[error("Hardware initialization failed for {resource}: {reason}")]
    HardwareInit {
        resource: String,
        reason: String,
    },

    #[error("Hardware write failed on channel {channel}: {reason}")]
    HardwareWrite {
        channel: u32,
        reason: String,
    },

    #[error("Hardware read failed on channel {channel}: {reason}")]
    HardwareRead {
        channel: u32,
        reason: String,
    },

    #[error("Failed to read temperature sensor {sensor_id}: {reason}")]
    SensorRead {
        sensor_id: String,
        reason: String,
    },

    #[error("Edge callback registration failed on channel {channel}: {reason}")]
    EdgeRegistration {
        channel: u32,
        reason: String,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Session Persistence Errors
    // ============================================================================
    #[error("Failed to persist {session} session: {reason}")]
    Persistence {
        session: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl ShopHeaterError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a fatal hardware initialization error
    pub fn hardware_init(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HardwareInit {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create a hardware write error
    pub fn hardware_write(channel: u32, reason: impl Into<String>) -> Self {
        Self::HardwareWrite {
            channel,
            reason: reason.into(),
        }
    }

    /// Create a sensor read error
    pub fn sensor_read(sensor_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SensorRead {
            sensor_id: sensor_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a session persistence error
    pub fn persistence(session: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Persistence {
            session: session.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that must abort startup of the owning component
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HardwareInit { .. } | Self::EdgeRegistration { .. })
    }
}

// Allow converting from String to ShopHeaterError
impl From<String> for ShopHeaterError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to ShopHeaterError
impl From<&str> for ShopHeaterError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ShopHeaterError::hardware_init("gpiochip0", "permission denied").is_fatal());
        assert!(!ShopHeaterError::hardware_write(23, "EIO").is_fatal());
        assert!(!ShopHeaterError::sensor_read("3ca4f649bbd0", "crc mismatch").is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = ShopHeaterError::hardware_write(24, "device busy");
        assert_eq!(err.to_string(), "Hardware write failed on channel 24: device busy");
    }
}
