//! # Adapter Error Types
//!
//! Structured error handling for the messaging adapter using thiserror.
//! Provider failures are wrapped into domain errors here so that raw
//! provider error types never leak to facade callers.

use thiserror::Error;

use crate::provider::ProviderError;

/// Error taxonomy for the adapter core.
///
/// Configuration errors are raised at setup time and are fatal to the
/// endpoint that raised them. Timeouts are a distinct, recoverable kind:
/// callers may retry.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Provider error during {operation}: {message}")]
    Provider { operation: String, message: String },

    #[error("Destination does not exist: {destination}")]
    InvalidDestination { destination: String },

    #[error("Timeout: operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Listener error: {message}")]
    Listener { message: String },

    #[error("Sender error: {message}")]
    Sender { message: String },

    #[error("Internal adapter error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a provider error
    pub fn provider(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an invalid destination error
    pub fn invalid_destination(destination: impl Into<String>) -> Self {
        Self::InvalidDestination {
            destination: destination.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a listener error
    pub fn listener(message: impl Into<String>) -> Self {
        Self::Listener {
            message: message.into(),
        }
    }

    /// Create a sender error
    pub fn sender(message: impl Into<String>) -> Self {
        Self::Sender {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is the recoverable timeout kind
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Conversion from provider errors. Invalid-destination failures keep their
/// identity so that `ignore_invalid_destination` can match on them.
impl From<ProviderError> for BridgeError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ConnectionFailed { message } => BridgeError::connection(message),
            ProviderError::InvalidDestination { destination } => {
                BridgeError::invalid_destination(destination)
            }
            ProviderError::Closed { resource } => BridgeError::provider("use-after-close", resource),
            ProviderError::Operation { operation, message } => {
                BridgeError::provider(operation, message)
            }
        }
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let cfg = BridgeError::configuration("listener", "destination name must be specified");
        assert!(matches!(cfg, BridgeError::Configuration { .. }));

        let conn = BridgeError::connection("could not obtain connection");
        assert!(matches!(conn, BridgeError::Connection { .. }));

        let timeout = BridgeError::timeout("receive", 5000);
        assert!(timeout.is_timeout());
        assert!(!conn.is_timeout());
    }

    #[test]
    fn test_provider_error_conversion() {
        let err: BridgeError = ProviderError::invalid_destination("reply-q-1").into();
        assert!(matches!(err, BridgeError::InvalidDestination { .. }));

        let err: BridgeError = ProviderError::connection_failed("broker unreachable").into();
        assert!(matches!(err, BridgeError::Connection { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = BridgeError::timeout("reply-wait", 5000);
        let display = format!("{err}");
        assert!(display.contains("reply-wait"));
        assert!(display.contains("5000ms"));

        let err = BridgeError::invalid_destination("orders.reply");
        assert!(format!("{err}").contains("orders.reply"));
    }
}
