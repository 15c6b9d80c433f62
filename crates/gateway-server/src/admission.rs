//! Admission hook.
//!
//! Runs after authentication and before the relay engine. A deny never
//! reaches the engine, so nothing is reserved or dispatched.

use async_trait::async_trait;
use axum::http::StatusCode;
use gateway_core::{CallerIdentity, ChatRequest};

/// Outcome of admission
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Hand the request to the engine
    Allow,
    /// Reject with this status and error body
    Deny {
        /// HTTP status
        status: StatusCode,
        /// Response body
        body: serde_json::Value,
    },
}

impl Decision {
    /// Deny with an OpenAI-style error body
    #[must_use]
    pub fn deny(status: StatusCode, message: impl Into<String>, code: &str) -> Self {
        Self::Deny {
            status,
            body: serde_json::json!({
                "error": {
                    "message": message.into(),
                    "type": "admission_error",
                    "code": code,
                }
            }),
        }
    }
}

/// Pre-engine admission control
#[async_trait]
pub trait Admission: Send + Sync {
    /// Decide whether `caller` may send `request`
    async fn admit(&self, caller: &CallerIdentity, request: &ChatRequest) -> Decision;
}

/// Admits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Admission for AllowAll {
    async fn admit(&self, _caller: &CallerIdentity, _request: &ChatRequest) -> Decision {
        Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        let request = ChatRequest::new("gpt-4", vec![]);
        let decision = AllowAll.admit(&CallerIdentity::new(1, 1), &request).await;
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn test_deny_body() {
        let Decision::Deny { status, body } =
            Decision::deny(StatusCode::TOO_MANY_REQUESTS, "slow down", "rate_limited")
        else {
            panic!("expected deny");
        };
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "rate_limited");
    }
}
