//! OpenAI-compatible adaptor.
//!
//! One wire protocol serves OpenAI, DeepSeek, OpenRouter, Xinference and any
//! custom endpoint that speaks `/v1/chat/completions`. Azure OpenAI uses the
//! same bodies behind deployment URLs and an `api-key` header.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use gateway_core::{estimate_tokens, ChatRequest, GatewayError, GatewayResult, RelayInfo, Usage};
use gateway_relay::{
    upstream_error, Adaptor, FrameHandler, RelayOutput, ResponseHead, ResponseWriter,
    StreamState, Translation, UpstreamRequest, UpstreamResponse, WriteError,
};
use http::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use crate::client::ClientPool;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Azure OpenAI API version
pub const DEFAULT_API_VERSION: &str = "2024-02-15-preview";

/// Largest non-streamed response body accepted
const MAX_RESPONSE_BODY: usize = 32 * 1024 * 1024;

/// URL and credential scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flavor {
    /// `{base}/v1/chat/completions` with a bearer token
    OpenAI,
    /// `{base}/openai/deployments/{model}/chat/completions` with `api-key`
    Azure {
        /// `api-version` query parameter
        api_version: String,
    },
}

/// Adaptor for OpenAI-compatible upstreams; one instance per request
#[derive(Debug, Clone)]
pub struct OpenAICompatibleAdaptor {
    clients: Arc<ClientPool>,
    client: Client,
    flavor: Flavor,
    default_base_url: Option<&'static str>,
    stream_usage: bool,
    endpoint: Option<String>,
    key: Option<SecretString>,
}

impl OpenAICompatibleAdaptor {
    /// Bearer-token adaptor with no default base URL
    #[must_use]
    pub fn new(clients: Arc<ClientPool>) -> Self {
        Self {
            client: clients.shared(),
            clients,
            flavor: Flavor::OpenAI,
            default_base_url: None,
            stream_usage: true,
            endpoint: None,
            key: None,
        }
    }

    /// Azure OpenAI adaptor
    #[cfg(feature = "azure")]
    #[must_use]
    pub fn azure(clients: Arc<ClientPool>) -> Self {
        Self {
            flavor: Flavor::Azure {
                api_version: DEFAULT_API_VERSION.to_string(),
            },
            ..Self::new(clients)
        }
    }

    /// Base URL used when the channel sets none
    #[must_use]
    pub fn with_default_base_url(mut self, base_url: Option<&'static str>) -> Self {
        self.default_base_url = base_url;
        self
    }

    /// Ask the upstream to append usage to streamed responses
    #[must_use]
    pub fn with_stream_usage(mut self, enabled: bool) -> Self {
        self.stream_usage = enabled;
        self
    }

    /// Target URL, set by `init`
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn completions_url(&self, base: &str, info: &RelayInfo) -> String {
        match &self.flavor {
            Flavor::OpenAI if base.ends_with("/v1") => format!("{base}/chat/completions"),
            Flavor::OpenAI => format!("{base}/v1/chat/completions"),
            Flavor::Azure { api_version } => {
                // deployment names cannot contain dots
                let deployment = info.upstream_model.replace('.', "");
                format!(
                    "{base}/openai/deployments/{deployment}/chat/completions?api-version={api_version}"
                )
            }
        }
    }

    async fn translate_stream(
        &self,
        response: UpstreamResponse,
        info: &mut RelayInfo,
        output: &RelayOutput,
    ) -> Translation {
        let mut handler = StreamRelay::default();
        let mut outcome = output
            .pipeline
            .run(response.body, &output.writer, &mut handler, info)
            .await;

        if let Some(e) = handler.write_error.take() {
            outcome.state = StreamState::Error;
            outcome.error = Some(GatewayError::internal(e.to_string()));
        } else if outcome.is_done() {
            if let Err(e) = output.writer.lock().await.write_done().await {
                debug!(request_id = %info.request_id, error = %e, "Failed to write stream terminator");
            }
        }

        let usage = handler.usage(info.prompt_tokens_estimate, outcome.frames);
        Translation::completed(usage).with_stream(outcome)
    }

    async fn translate_json(
        &self,
        response: UpstreamResponse,
        info: &mut RelayInfo,
        output: &RelayOutput,
    ) -> Translation {
        let status = response.status;
        let body = match response.read_body(MAX_RESPONSE_BODY).await {
            Ok(body) => body,
            Err(e) => return Translation::failed(Usage::default(), e),
        };
        info.set_first_response_time(Instant::now());

        let completion: Completion = match serde_json::from_slice(&body) {
            Ok(completion) => completion,
            Err(e) => {
                return Translation::failed(
                    Usage::default(),
                    GatewayError::translation(format!("invalid upstream response: {e}")),
                )
            }
        };
        if completion.error.as_ref().is_some_and(|e| !e.is_null()) {
            let code = if status.is_success() { 502 } else { status.as_u16() };
            return Translation::failed(Usage::default(), upstream_error(code, &body));
        }

        let usage = completion
            .usage
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| {
                Usage::new(
                    info.prompt_tokens_estimate,
                    estimate_tokens(&completion.text()),
                )
            });

        let mut writer = output.writer.lock().await;
        writer.send_head(ResponseHead::json(status));
        let written = match writer.write(body).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Translation::completed(usage),
            Err(e) => Translation::failed(usage, GatewayError::internal(e.to_string())),
        }
    }
}

#[async_trait]
impl Adaptor for OpenAICompatibleAdaptor {
    fn name(&self) -> &'static str {
        match self.flavor {
            Flavor::OpenAI => "openai-compatible",
            Flavor::Azure { .. } => "azure-openai",
        }
    }

    fn init(&mut self, info: &RelayInfo) -> GatewayResult<()> {
        let channel = &info.channel;
        let base = channel
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .or(self.default_base_url)
            .ok_or_else(|| {
                GatewayError::configuration(format!("channel {} has no base URL", channel.id))
            })?;
        url::Url::parse(base).map_err(|e| {
            GatewayError::configuration(format!("channel {} has an invalid base URL: {e}", channel.id))
        })?;

        self.client = self.clients.client_for(channel.proxy.as_deref())?;
        self.endpoint = Some(self.completions_url(base.trim_end_matches('/'), info));
        self.key = Some(channel.key.clone());
        Ok(())
    }

    fn build_request(
        &self,
        info: &RelayInfo,
        request: &ChatRequest,
    ) -> GatewayResult<UpstreamRequest> {
        let (Some(endpoint), Some(key)) = (&self.endpoint, &self.key) else {
            return Err(GatewayError::internal("adaptor used before init"));
        };

        let mut body = request.clone();
        body.model.clone_from(&info.upstream_model);
        if body.stream && self.stream_usage && self.flavor == Flavor::OpenAI {
            body.stream_options = Some(serde_json::json!({ "include_usage": true }));
        }
        let encoded = serde_json::to_vec(&body)
            .map_err(|e| GatewayError::translation(format!("failed to encode request: {e}")))?;

        let (name, credential) = match self.flavor {
            Flavor::OpenAI => (AUTHORIZATION, format!("Bearer {}", key.expose_secret())),
            Flavor::Azure { .. } => (
                HeaderName::from_static("api-key"),
                key.expose_secret().clone(),
            ),
        };
        let mut credential = HeaderValue::from_str(&credential).map_err(|_| {
            GatewayError::configuration(format!(
                "channel {} key is not a valid header value",
                info.channel.id
            ))
        })?;
        credential.set_sensitive(true);

        let mut upstream = UpstreamRequest::post(endpoint.clone(), Bytes::from(encoded));
        upstream
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.headers.insert(
            ACCEPT,
            HeaderValue::from_static(if body.stream {
                "text/event-stream"
            } else {
                "application/json"
            }),
        );
        upstream.headers.insert(name, credential);
        Ok(upstream)
    }

    async fn execute(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
        debug!(url = %request.url, adaptor = self.name(), "Sending upstream request");

        let response = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                let status = if e.is_timeout() { 504 } else { 502 };
                GatewayError::upstream(status, format!("upstream request failed: {e}"))
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| GatewayError::upstream(502, format!("upstream body failed: {e}")))
            })
            .boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    async fn translate_response(
        &mut self,
        response: UpstreamResponse,
        info: &mut RelayInfo,
        output: &RelayOutput,
    ) -> Translation {
        if info.is_stream {
            self.translate_stream(response, info, output).await
        } else {
            self.translate_json(response, info, output).await
        }
    }
}

/// Forwards stream frames verbatim while collecting usage
#[derive(Debug, Default)]
struct StreamRelay {
    text: String,
    usage: Option<Usage>,
    write_error: Option<WriteError>,
}

impl StreamRelay {
    /// Reported usage, else an estimate from the streamed text.
    ///
    /// A stream that produced no frames owes nothing.
    fn usage(&self, prompt_estimate: u32, frames: usize) -> Usage {
        match self.usage {
            Some(usage) => usage,
            None if frames == 0 => Usage::default(),
            None => Usage::new(prompt_estimate, estimate_tokens(&self.text)),
        }
    }
}

#[async_trait]
impl FrameHandler for StreamRelay {
    async fn on_frame(&mut self, data: &str, writer: &mut dyn ResponseWriter) -> ControlFlow<()> {
        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => {
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        self.text.push_str(&content);
                    }
                }
                if let Some(usage) = chunk.usage.filter(|u| !u.is_empty()) {
                    self.usage = Some(usage);
                }
            }
            Err(e) => trace!(error = %e, "Forwarding unparsed stream chunk"),
        }

        match writer.write_data(data).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                self.write_error = Some(e);
                ControlFlow::Break(())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl Completion {
    /// Concatenated assistant text, including text parts of array content
    fn text(&self) -> String {
        let mut text = String::new();
        for content in self
            .choices
            .iter()
            .filter_map(|c| c.message.as_ref()?.content.as_ref())
        {
            match content {
                serde_json::Value::String(s) => text.push_str(s),
                serde_json::Value::Array(parts) => {
                    for part in parts.iter().filter_map(|p| p.get("text")?.as_str()) {
                        text.push_str(part);
                    }
                }
                _ => {}
            }
        }
        text
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<serde_json::Value>,
}
