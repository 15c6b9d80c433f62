//! Error types for the gateway.
//!
//! Every failure a relay attempt can hit maps onto one variant here. The
//! variant decides the HTTP status, the OpenAI-style error type, and whether
//! the failure is worth retrying on another channel.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the gateway crates
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error taxonomy
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Misconfiguration that makes the request impossible to serve
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// The channel references a provider type with no registered adaptor
    #[error("Invalid api type: {provider_type}")]
    UnknownProviderType {
        /// Provider type tag as stored on the channel
        provider_type: String,
    },

    /// No enabled channel can serve the requested model
    #[error("No available channel for model {model}")]
    NoChannelAvailable {
        /// Requested model
        model: String,
    },

    /// Caller balance cannot cover the reservation
    #[error("Insufficient quota: required {required}, available {available}")]
    InsufficientQuota {
        /// Quota the reservation needed
        required: i64,
        /// Quota the ledger had
        available: i64,
    },

    /// Upstream dispatch failed or returned a non-success status
    #[error("Upstream error ({status}): {message}")]
    Upstream {
        /// Upstream HTTP status, 502 for transport failures
        status: u16,
        /// Error message
        message: String,
        /// Whether another attempt could succeed
        retryable: bool,
    },

    /// The stream went idle for longer than allowed
    #[error("Stream idle timeout after {}s", .idle.as_secs())]
    StreamTimeout {
        /// Idle window that elapsed
        idle: Duration,
    },

    /// Upstream did not answer in time
    #[error("Upstream timeout after {}s waiting for {stage}", .after.as_secs())]
    UpstreamTimeout {
        /// What was being waited for
        stage: &'static str,
        /// Deadline that elapsed
        after: Duration,
    },

    /// The caller went away or the gateway is shutting down
    #[error("Request cancelled")]
    Cancelled,

    /// Upstream body could not be translated
    #[error("Translation error: {message}")]
    Translation {
        /// Error message
        message: String,
    },

    /// Ledger read or write failed
    #[error("Ledger error: {message}")]
    Ledger {
        /// Error message
        message: String,
    },

    /// Caller could not be authenticated
    #[error("Authentication error: {message}")]
    Authentication {
        /// Error message
        message: String,
    },

    /// Request payload is invalid
    #[error("Validation error: {message}")]
    Validation {
        /// Error message
        message: String,
        /// Offending field, if known
        field: Option<String>,
    },

    /// Unexpected internal failure
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl GatewayError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an upstream error
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
            retryable: status == 429 || status >= 500,
        }
    }

    /// Create a translation error
    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation {
            message: message.into(),
        }
    }

    /// Create a ledger error
    pub fn ledger(message: impl Into<String>) -> Self {
        Self::Ledger {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Validation {
            message: message.into(),
            field: field.map(ToString::to_string),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code surfaced to the caller
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration { .. } | Self::Ledger { .. } | Self::Internal { .. } => 500,
            Self::Translation { .. } => 500,
            Self::UnknownProviderType { .. } | Self::Validation { .. } => 400,
            Self::NoChannelAvailable { .. } => 503,
            Self::InsufficientQuota { .. } => 403,
            Self::Upstream { status, .. } => *status,
            Self::StreamTimeout { .. } | Self::UpstreamTimeout { .. } => 504,
            Self::Cancelled => 499,
            Self::Authentication { .. } => 401,
        }
    }

    /// OpenAI-style error type
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. }
            | Self::UnknownProviderType { .. }
            | Self::NoChannelAvailable { .. } => "gateway_error",
            Self::InsufficientQuota { .. } => "insufficient_quota",
            Self::Upstream { .. }
            | Self::StreamTimeout { .. }
            | Self::UpstreamTimeout { .. }
            | Self::Translation { .. } => "upstream_error",
            Self::Cancelled => "gateway_error",
            Self::Authentication { .. } => "authentication_error",
            Self::Validation { .. } => "invalid_request_error",
            Self::Ledger { .. } | Self::Internal { .. } => "server_error",
        }
    }

    /// Stable machine-readable code
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::UnknownProviderType { .. } => "invalid_api_type",
            Self::NoChannelAvailable { .. } => "no_available_channel",
            Self::InsufficientQuota { .. } => "insufficient_user_quota",
            Self::Upstream { .. } => "bad_response_status_code",
            Self::StreamTimeout { .. } => "stream_timeout",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::Cancelled => "request_cancelled",
            Self::Translation { .. } => "translate_response_failed",
            Self::Ledger { .. } => "ledger_error",
            Self::Authentication { .. } => "invalid_api_key",
            Self::Validation { .. } => "invalid_request",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Whether another attempt could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { retryable, .. } => *retryable,
            Self::StreamTimeout { .. } | Self::UpstreamTimeout { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(err.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::configuration("x").status_code(), 500);
        assert_eq!(
            GatewayError::UnknownProviderType {
                provider_type: "mystery".into()
            }
            .status_code(),
            400
        );
        assert_eq!(
            GatewayError::InsufficientQuota {
                required: 10,
                available: 1
            }
            .status_code(),
            403
        );
        assert_eq!(GatewayError::upstream(429, "slow down").status_code(), 429);
        assert_eq!(
            GatewayError::StreamTimeout {
                idle: Duration::from_secs(60)
            }
            .status_code(),
            504
        );
    }

    #[test]
    fn test_retryable() {
        assert!(GatewayError::upstream(503, "down").is_retryable());
        assert!(GatewayError::upstream(429, "limited").is_retryable());
        assert!(!GatewayError::upstream(400, "bad").is_retryable());
        assert!(!GatewayError::NoChannelAvailable {
            model: "gpt-4".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_display() {
        let err = GatewayError::StreamTimeout {
            idle: Duration::from_secs(120),
        };
        assert_eq!(err.to_string(), "Stream idle timeout after 120s");
        assert_eq!(err.error_code(), "stream_timeout");
    }

    #[test]
    fn test_timeout_and_cancellation() {
        let err = GatewayError::UpstreamTimeout {
            stage: "response headers",
            after: Duration::from_secs(30),
        };
        assert_eq!(err.status_code(), 504);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Upstream timeout after 30s waiting for response headers");

        assert_eq!(GatewayError::Cancelled.status_code(), 499);
        assert_eq!(GatewayError::Cancelled.error_code(), "request_cancelled");
        assert!(!GatewayError::Cancelled.is_retryable());
    }
}
