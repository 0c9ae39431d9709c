// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all convertible into `PulseError`.
// Collector-side failures never reach this hierarchy's callers: they are
// logged and dropped where they happen.
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Vitals error: {0}")]
    Vitals(#[from] VitalsError),

    #[error("Access denied: {reason}")]
    Forbidden { reason: String },

    #[error("Unknown action '{action}'")]
    UnknownAction { action: String },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request did not complete within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PulseError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PulseError::Config(_) => false,
            PulseError::Store(e) => e.is_recoverable(),
            PulseError::Vitals(_) => true,
            PulseError::Forbidden { .. } => false,
            PulseError::UnknownAction { .. } => false,
            PulseError::BadRequest { .. } => false,
            PulseError::Io(_) => true,
            PulseError::Timeout { .. } => true,
            PulseError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PulseError::Config(_) => "config",
            PulseError::Store(_) => "store",
            PulseError::Vitals(_) => "vitals",
            PulseError::Forbidden { .. } => "access",
            PulseError::UnknownAction { .. } => "request",
            PulseError::BadRequest { .. } => "request",
            PulseError::Io(_) => "io",
            PulseError::Timeout { .. } => "request",
            PulseError::Internal(_) => "internal",
        }
    }

    /// Error code returned to API callers
    pub fn code(&self) -> &'static str {
        match self {
            PulseError::Forbidden { .. } => "FORBIDDEN",
            PulseError::UnknownAction { .. } => "UNKNOWN_ACTION",
            PulseError::BadRequest { .. } => "BAD_REQUEST",
            PulseError::Timeout { .. } => "REQUEST_TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        PulseError::Forbidden {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Store Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::Timeout { .. } => true,
            StoreError::Unavailable { .. } => true,
            StoreError::Serialization { .. } => false,
            StoreError::Io(_) => true,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: e.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Vitals Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VitalsError {
    #[error("Signal '{signal}' is not supported by this source")]
    Unsupported { signal: String },

    #[error("Subscription to '{signal}' failed: {message}")]
    SubscriptionFailed { signal: String, message: String },
}

// ----------------------------------------------------------------------------
// Alert Sink Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Alert sink is full")]
    Full,

    #[error("Alert sink is closed")]
    Closed,
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Main result type for engine operations
pub type PulseResult<T> = Result<T, PulseError>;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(PulseError::forbidden("no token").code(), "FORBIDDEN");
        assert_eq!(
            PulseError::UnknownAction { action: "x".into() }.code(),
            "UNKNOWN_ACTION"
        );
        assert_eq!(PulseError::Internal("boom".into()).code(), "INTERNAL_ERROR");
        assert_eq!(PulseError::Timeout { timeout_ms: 5 }.code(), "REQUEST_TIMEOUT");
        assert_eq!(
            PulseError::from(StoreError::unavailable("down")).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_store_error_recoverability() {
        let timeout = StoreError::Timeout {
            operation: "query_range".into(),
            timeout_ms: 10,
        };
        assert!(timeout.is_recoverable());
        assert!(PulseError::from(timeout).is_recoverable());
        assert!(!StoreError::Serialization { message: "bad".into() }.is_recoverable());
        assert!(!PulseError::forbidden("nope").is_recoverable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(PulseError::forbidden("x").category(), "access");
        let cfg = PulseError::from(ConfigError::invalid_value("server.bind_addr", "bad"));
        assert_eq!(cfg.category(), "config");
        assert!(cfg.to_string().contains("server.bind_addr"));
    }
}
