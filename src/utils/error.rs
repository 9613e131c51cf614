//! Error types for the courtside booking core
//!
//! This module defines custom error types used throughout the application.

use thiserror::Error;

/// Errors that can occur while talking to the platform
#[derive(Error, Debug)]
pub enum ApiError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Server error with status code
    #[error("Server error: {0}")]
    ServerError(u16),

    /// Platform signalled that the client is sending too many requests
    #[error("Rate limited by platform")]
    RateLimited,

    /// Session cookie or token was rejected
    #[error("Session expired or rejected")]
    AuthExpired,

    /// Response body could not be decoded
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Maximum retry attempts exceeded
    #[error("Maximum retry attempts exceeded")]
    MaxRetriesExceeded,
}

/// Errors raised at the raw-record parsing boundary
///
/// Upstream slot records are loosely typed; parsing fails closed rather
/// than silently defaulting missing fields.
#[derive(Error, Debug)]
pub enum ParseError {
    /// A required field was absent from the upstream record
    #[error("missing field in slot record: {0}")]
    MissingField(&'static str),

    /// A time label could not be normalized to HH:MM
    #[error("unrecognized time label: {0}")]
    InvalidTimeLabel(String),

    /// Invalid date format
    #[error("invalid date: {0}")]
    InvalidDate(String),

    /// Payload carried no slot list at all
    #[error("no slot list found in payload")]
    EmptyPayload,
}

/// General booking-core errors
#[derive(Error, Debug)]
pub enum BookingError {
    /// API error
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The slot's sign was rejected or the slot was taken by someone else
    #[error("Slot gone: {0}")]
    SlotGone(String),

    /// Captcha solving exhausted its attempt budget
    #[error("Captcha unsolved after {attempts} attempts")]
    CaptchaFailed { attempts: u32 },

    /// Missing or invalid static configuration; never retried
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire encryption failed
    #[error("Encryption error: {0}")]
    Crypto(String),

    /// Credential store could not be read or written
    #[error("Credential store error: {0}")]
    Store(String),

    /// Every configured account was tried and rejected
    #[error("All accounts exhausted")]
    AccountsExhausted,
}

impl BookingError {
    /// Whether this error should end the job rather than the current cycle
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Crypto(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_converts_to_booking_error() {
        let err: BookingError = ApiError::RateLimited.into();
        assert!(matches!(err, BookingError::Api(ApiError::RateLimited)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(BookingError::Config("missing public key".into()).is_fatal());
        assert!(BookingError::Crypto("bad key length".into()).is_fatal());
        assert!(!BookingError::SlotGone("consumed".into()).is_fatal());
        assert!(!BookingError::AccountsExhausted.is_fatal());
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::InvalidTimeLabel("slot-x".into());
        assert!(err.to_string().contains("slot-x"));
    }
}
