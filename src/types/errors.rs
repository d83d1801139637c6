//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. These cover configuration, linking and
//! API misuse. Runtime failures inside a process travel as
//! [`Escalation`](crate::kernel::Escalation) instead.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by user functions, duties, sources and governance.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error enum for the office kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Metadata could not be linked (unknown names, bad scopes, cycles).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid argument supplied to a kernel API.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced function, flow, governance or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// The office or process is no longer accepting work.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether this error was raised while linking office metadata.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let err = Error::configuration("unknown governance 'tx'");
        assert_eq!(err.to_string(), "configuration error: unknown governance 'tx'");
        assert!(err.is_configuration());
        assert!(!Error::not_found("x").is_configuration());
    }

    #[test]
    fn test_error_boxes_into_box_error() {
        let boxed: BoxError = Error::validation("bad flow index").into();
        assert!(boxed.is::<Error>());
    }
}
