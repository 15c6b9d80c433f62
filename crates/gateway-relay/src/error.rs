//! Caller-facing relay errors.

use gateway_core::{Channel, GatewayError};
use http::StatusCode;

/// Longest upstream error text kept in a message
const MAX_UPSTREAM_MESSAGE: usize = 512;

/// A relay failure and the status the caller sees
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct RelayError {
    status: StatusCode,
    #[source]
    error: GatewayError,
}

impl RelayError {
    /// Use the error's own status
    #[must_use]
    pub fn new(error: GatewayError) -> Self {
        let status = to_status(error.status_code());
        Self { status, error }
    }

    /// Apply the channel's status-code mapping
    #[must_use]
    pub fn for_channel(error: GatewayError, channel: &Channel) -> Self {
        let status = to_status(channel.map_status(error.status_code()));
        Self { status, error }
    }

    /// Status sent to the caller
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Underlying error
    #[must_use]
    pub fn error(&self) -> &GatewayError {
        &self.error
    }

    /// Consume into the underlying error
    #[must_use]
    pub fn into_error(self) -> GatewayError {
        self.error
    }
}

impl From<GatewayError> for RelayError {
    fn from(error: GatewayError) -> Self {
        Self::new(error)
    }
}

fn to_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// OpenAI-style error body: `{"error":{"message","type","code"}}`
#[must_use]
pub fn error_body(error: &GatewayError) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": error.to_string(),
            "type": error.error_type(),
            "code": error.error_code(),
        }
    })
}

/// Upstream error from a non-success response body.
///
/// Understands `{"error":{"message":..}}`, `{"error":".."}` and
/// `{"message":..}`; anything else is kept as text.
#[must_use]
pub fn upstream_error(status: u16, body: &[u8]) -> GatewayError {
    let parsed = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            let error = value.get("error");
            error
                .and_then(|e| e.get("message"))
                .or(error.filter(|e| e.is_string()))
                .or_else(|| value.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });

    let message = parsed.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        if text.is_empty() {
            format!("upstream returned status {status}")
        } else {
            text.chars().take(MAX_UPSTREAM_MESSAGE).collect()
        }
    });

    GatewayError::upstream(status, message)
}
