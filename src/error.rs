//! Custom error types for the proxy.
//!
//! This module defines the primary error type, `GuardError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes the proxy can
//! encounter, from configuration and I/O issues to device-reported faults.
//!
//! ## Error Hierarchy
//!
//! `GuardError` is an enum that consolidates the failure taxonomy:
//!
//! - **`PolicyRejected`**: The safety policy refused the operation locally,
//!   before any wire traffic. Expected and frequent; never logged as an error.
//! - **`LinkUnavailable`**: The device connection could not be established or
//!   re-established, or an operation is blocked pending resynchronization.
//! - **`LinkTimeout`**: A wire round trip exceeded its deadline. The outcome
//!   on the device is indeterminate until the next status resync.
//! - **`Protocol`**: The device sent a response line the codec could not
//!   decode (malformed JSON or an unexpected shape). Never coerced to a
//!   default value.
//! - **`DeviceFault`**: The device reported an error despite local admission.
//!   Terminal fault codes latch the shadow `broken` flag.
//! - **`Config`** / **`InvalidConfig`**: Parse errors from `figment` and
//!   semantic errors caught during settings validation, respectively.
//! - **`Io`**: Wraps `std::io::Error` for everything else.

use crate::policy::RejectReason;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type GuardResult<T> = std::result::Result<T, GuardError>;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("operation refused: {0}")]
    PolicyRejected(RejectReason),

    #[error("device link unavailable: {0}")]
    LinkUnavailable(String),

    #[error("device round trip timed out after {0:?}; outcome indeterminate")]
    LinkTimeout(std::time::Duration),

    #[error("malformed device response: {0}")]
    Protocol(String),

    #[error("device reported {code}: {message}")]
    DeviceFault { code: String, message: String },

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("configuration validation error: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardError {
    /// Stable identifier for the error class, used in caller-facing outcomes.
    ///
    /// Policy rejections surface the reject reason itself; device faults
    /// surface the device's code verbatim.
    pub fn code(&self) -> String {
        match self {
            GuardError::PolicyRejected(reason) => reason.as_str().to_string(),
            GuardError::LinkUnavailable(_) => "LinkUnavailable".to_string(),
            GuardError::LinkTimeout(_) => "LinkTimeout".to_string(),
            GuardError::Protocol(_) => "ProtocolError".to_string(),
            GuardError::DeviceFault { code, .. } => code.clone(),
            GuardError::Config(_) | GuardError::InvalidConfig(_) => "ConfigError".to_string(),
            GuardError::Io(_) => "IoError".to_string(),
        }
    }

    /// True for local policy refusals, which carry no wire traffic and are
    /// reported to callers as "you may not do this", not as a device failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, GuardError::PolicyRejected(_))
    }
}
