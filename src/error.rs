//! Error types for the constrained-device connection layer
//!
//! Only construction-time failures surface as errors. Protocol operations
//! log and report failure through their `bool`/`Option` return values.

use thiserror::Error;

/// Main error type for connection-layer construction and setup
#[derive(Debug, Error)]
pub enum CdaError {
    #[error("Failed to resolve host {host}:{port}: {message}")]
    HostResolution {
        host: String,
        port: u16,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] crate::data::CodecError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] crate::mqtt::MqttError),

    #[error("Resource registration failed: {0}")]
    Registration(#[from] crate::coap::server::RegistrationError),

    #[error("Event loop error: {0}")]
    EventLoop(#[from] crate::runtime::LoopError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CdaError {
    /// Create host resolution error
    pub fn host_resolution<S: Into<String>, M: std::fmt::Display>(host: S, port: u16, message: M) -> Self {
        Self::HostResolution {
            host: host.into(),
            port,
            message: message.to_string(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for failures that happen before any I/O: bad config or an
    /// unresolvable host
    pub fn is_startup_error(&self) -> bool {
        matches!(self, CdaError::HostResolution { .. } | CdaError::Config(_))
    }
}

/// Result type for connection-layer construction
pub type CdaResult<T> = Result<T, CdaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_host_resolution_constructor() {
        let error = CdaError::host_resolution("nowhere.invalid", 5683, "no addresses");
        assert!(matches!(error, CdaError::HostResolution { port: 5683, .. }));
        assert_eq!(
            error.to_string(),
            "Failed to resolve host nowhere.invalid:5683: no addresses"
        );
        assert!(error.is_startup_error());
    }

    #[test]
    fn test_internal_error_constructor() {
        let error = CdaError::internal_error("unexpected state");
        assert_eq!(error.to_string(), "Internal error: unexpected state");
        assert!(!error.is_startup_error());
    }

    #[test]
    fn test_config_error_converts() {
        let error: CdaError = ConfigError::InvalidConfig("bad port".to_string()).into();
        assert!(matches!(error, CdaError::Config(_)));
        assert!(error.to_string().contains("bad port"));
        assert!(error.is_startup_error());
    }

    #[test]
    fn test_io_error_converts() {
        let error: CdaError =
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken").into();
        assert!(matches!(error, CdaError::Io(_)));
    }
}
