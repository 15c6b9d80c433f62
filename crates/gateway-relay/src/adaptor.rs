//! Provider adaptor contract and registry.
//!
//! Every upstream protocol is reached through the same four steps: `init`
//! from the relay record, `build_request` from the canonical request,
//! `execute`, and `translate_response`, which writes the caller's response
//! and reports usage. The orchestrator only ever sees this trait; the
//! [`AdaptorRegistry`] maps a channel's provider type to a factory.

use crate::stream::{ByteStream, StreamOutcome, StreamPipeline};
use crate::writer::SharedWriter;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use gateway_core::{ChatRequest, GatewayError, GatewayResult, ProviderType, RelayInfo, Usage};
use http::{HeaderMap, Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;

/// Outbound call built by an adaptor
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// HTTP method
    pub method: Method,
    /// Target URL
    pub url: String,
    /// Request headers, credentials included
    pub headers: HeaderMap,
    /// Encoded body
    pub body: Bytes,
}

impl UpstreamRequest {
    /// A POST of `body` to `url`
    #[must_use]
    pub fn post(url: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body,
        }
    }
}

/// Raw upstream response.
///
/// The body is any byte stream, so message-oriented transports can be
/// represented by mapping each message to a chunk.
pub struct UpstreamResponse {
    /// Upstream status
    pub status: StatusCode,
    /// Upstream headers
    pub headers: HeaderMap,
    /// Upstream body
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl UpstreamResponse {
    /// Response with empty headers
    #[must_use]
    pub fn new(status: StatusCode, body: ByteStream) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    /// Read the whole body, failing past `limit` bytes
    ///
    /// # Errors
    /// Returns error on a body failure or when the body is too large
    pub async fn read_body(self, limit: usize) -> GatewayResult<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(GatewayError::translation(format!(
                    "upstream body exceeds {limit} bytes"
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// Where a translated response goes
#[derive(Clone)]
pub struct RelayOutput {
    /// Caller response
    pub writer: SharedWriter,
    /// Pipeline for streamed responses
    pub pipeline: StreamPipeline,
}

/// Result of translating an upstream response
#[derive(Debug, Default)]
pub struct Translation {
    /// Usage to settle against
    pub usage: Usage,
    /// Failure after dispatch
    pub error: Option<GatewayError>,
    /// Stream outcome, for streamed responses
    pub stream: Option<StreamOutcome>,
}

impl Translation {
    /// Successful translation
    #[must_use]
    pub fn completed(usage: Usage) -> Self {
        Self {
            usage,
            ..Self::default()
        }
    }

    /// Failed translation with best-known usage
    #[must_use]
    pub fn failed(usage: Usage, error: GatewayError) -> Self {
        Self {
            usage,
            error: Some(error),
            stream: None,
        }
    }

    /// Attach the stream outcome; its error becomes the translation error
    /// unless one is already set
    #[must_use]
    pub fn with_stream(mut self, mut outcome: StreamOutcome) -> Self {
        if self.error.is_none() {
            self.error = outcome.error.take();
        }
        self.stream = Some(outcome);
        self
    }
}

/// Provider-specific relay implementation; one instance per request
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Adaptor name for logs
    fn name(&self) -> &'static str;

    /// Configure per-request state from the relay record
    ///
    /// # Errors
    /// Returns error if the channel cannot be used by this adaptor
    fn init(&mut self, info: &RelayInfo) -> GatewayResult<()>;

    /// Translate the canonical request into the provider's wire format
    ///
    /// # Errors
    /// Returns error if the request cannot be expressed for this provider
    fn build_request(&self, info: &RelayInfo, request: &ChatRequest)
        -> GatewayResult<UpstreamRequest>;

    /// Perform the call
    ///
    /// # Errors
    /// Returns error if the upstream cannot be reached
    async fn execute(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse>;

    /// Write the caller's response and report usage
    async fn translate_response(
        &mut self,
        response: UpstreamResponse,
        info: &mut RelayInfo,
        output: &RelayOutput,
    ) -> Translation;
}

/// Builds a fresh adaptor for one request
pub type AdaptorFactory = Arc<dyn Fn() -> Box<dyn Adaptor> + Send + Sync>;

/// Provider type to adaptor factory
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    factories: HashMap<ProviderType, AdaptorFactory>,
}

impl std::fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorRegistry")
            .field("providers", &self.provider_types())
            .finish()
    }
}

impl AdaptorRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `provider`, replacing any previous entry
    pub fn register<F>(&mut self, provider: ProviderType, factory: F)
    where
        F: Fn() -> Box<dyn Adaptor> + Send + Sync + 'static,
    {
        self.factories.insert(provider, Arc::new(factory));
    }

    /// Builder form of [`register`](Self::register)
    #[must_use]
    pub fn with_adaptor<F>(mut self, provider: ProviderType, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Adaptor> + Send + Sync + 'static,
    {
        self.register(provider, factory);
        self
    }

    /// An adaptor is registered for `provider`
    #[must_use]
    pub fn supports(&self, provider: &ProviderType) -> bool {
        self.factories.contains_key(provider)
    }

    /// Registered provider types, sorted by tag
    #[must_use]
    pub fn provider_types(&self) -> Vec<ProviderType> {
        let mut types: Vec<_> = self.factories.keys().cloned().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    /// Fresh adaptor for `provider`
    ///
    /// # Errors
    /// Returns `UnknownProviderType` when nothing is registered
    pub fn create(&self, provider: &ProviderType) -> GatewayResult<Box<dyn Adaptor>> {
        self.factories
            .get(provider)
            .map(|factory| factory())
            .ok_or_else(|| GatewayError::UnknownProviderType {
                provider_type: provider.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedAdaptor;
    use futures::stream;

    #[test]
    fn test_unknown_provider_type() {
        let registry = AdaptorRegistry::new();
        let err = registry
            .create(&ProviderType::Other("palm".to_string()))
            .err()
            .unwrap();
        assert_eq!(err.error_code(), "invalid_api_type");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_registry_creates_fresh_instances() {
        let registry = AdaptorRegistry::new()
            .with_adaptor(ProviderType::OpenAI, || Box::new(ScriptedAdaptor::json(r#"{}"#)))
            .with_adaptor(ProviderType::DeepSeek, || Box::new(ScriptedAdaptor::json(r#"{}"#)));

        assert!(registry.supports(&ProviderType::OpenAI));
        assert!(!registry.supports(&ProviderType::Azure));
        assert_eq!(
            registry.provider_types(),
            vec![ProviderType::DeepSeek, ProviderType::OpenAI]
        );
        assert_eq!(registry.create(&ProviderType::OpenAI).unwrap().name(), "scripted");
    }

    #[tokio::test]
    async fn test_read_body_limit() {
        let chunks: Vec<GatewayResult<Bytes>> =
            vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let response = UpstreamResponse::new(StatusCode::OK, Box::pin(stream::iter(chunks)));
        assert_eq!(response.read_body(64).await.unwrap(), "hello world");

        let chunks: Vec<GatewayResult<Bytes>> =
            vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let response = UpstreamResponse::new(StatusCode::OK, Box::pin(stream::iter(chunks)));
        assert!(response.read_body(8).await.is_err());
    }
}
