//! Canonical chat request.
//!
//! The gateway speaks the OpenAI chat-completions dialect. Fields the relay
//! does not inspect are kept in `extra` and forwarded untouched, so new
//! upstream parameters pass through without a gateway release.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// OpenAI-compatible chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Target model (e.g., "gpt-4o", "deepseek-chat")
    pub model: String,

    /// Chat messages for conversation
    pub messages: Vec<ChatMessage>,

    /// Enable streaming response
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 - 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Streaming options such as `include_usage`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<Value>,

    /// Everything else, forwarded verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role
    pub role: String,

    /// String or array-of-parts content
    #[serde(default)]
    pub content: Value,

    /// Everything else (name, tool_calls, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    /// Create a plain-text message
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
            extra: Map::new(),
        }
    }

    /// Text content, concatenating text parts
    #[must_use]
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

impl ChatRequest {
    /// Create a request
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            max_tokens: None,
            temperature: None,
            stream_options: None,
            extra: Map::new(),
        }
    }

    /// Enable or disable streaming
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Check the request is routable
    ///
    /// # Errors
    /// Returns error if the model is blank or no messages were sent
    pub fn validate(&self) -> Result<(), crate::error::GatewayError> {
        if self.model.trim().is_empty() {
            return Err(crate::error::GatewayError::validation(
                "model is required",
                Some("model"),
            ));
        }
        if self.messages.is_empty() {
            return Err(crate::error::GatewayError::validation(
                "messages must not be empty",
                Some("messages"),
            ));
        }
        Ok(())
    }

    /// All message text, used for token estimates
    #[must_use]
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(ChatMessage::text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Rough token estimate (~4 chars per token, at least one for non-empty text)
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        (chars.div_ceil(4)) as u32
    }
}
