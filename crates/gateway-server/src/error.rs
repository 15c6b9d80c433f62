//! API error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::GatewayError;
use gateway_relay::RelayError;
use tracing::error;

/// Error rendered as an OpenAI-style body:
/// `{"error":{"message","type","code"}}`
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    /// HTTP status
    pub status: StatusCode,
    /// Human-readable message
    pub message: String,
    /// Error type
    pub error_type: &'static str,
    /// Machine-readable code
    pub code: &'static str,
}

impl ApiError {
    /// Create an error
    #[must_use]
    pub fn new(
        status: StatusCode,
        message: impl Into<String>,
        error_type: &'static str,
        code: &'static str,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            error_type,
            code,
        }
    }

    /// 400 for a malformed request
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            message,
            "invalid_request_error",
            "invalid_request",
        )
    }

    /// 401 for a missing or unknown credential
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            message,
            "authentication_error",
            "invalid_api_key",
        )
    }

    /// 500 for anything unexpected
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
            "server_error",
            "internal_error",
        )
    }

    /// The response body
    #[must_use]
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.message,
                "type": self.error_type,
                "code": self.code,
            }
        })
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        RelayError::from(err).into()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = err.status();
        let inner = err.into_error();
        Self::new(status, inner.to_string(), inner.error_type(), inner.error_code())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), code = self.code, message = %self.message, "Request failed");
        }
        (self.status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{Channel, ProviderType};

    #[test]
    fn test_relay_error_keeps_mapped_status() {
        let channel = Channel::new(1, ProviderType::OpenAI, "k").with_status_code_mapping(429, 503);
        let err: ApiError = RelayError::for_channel(GatewayError::upstream(429, "slow down"), &channel).into();

        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "bad_response_status_code");
        assert_eq!(err.body()["error"]["type"], "upstream_error");
    }

    #[test]
    fn test_quota_error_body() {
        let err = ApiError::from(GatewayError::InsufficientQuota {
            required: 100,
            available: 5,
        });
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.body()["error"]["code"], "insufficient_user_quota");
    }
}
