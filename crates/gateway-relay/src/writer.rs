//! Outward response writer.
//!
//! The relay never talks to the HTTP framework directly. It writes through a
//! [`ResponseWriter`], which the server backs with a channel into the response
//! body and tests back with a [`MemoryWriter`]. One writer is shared per
//! request behind a single async lock so the frame handler and the keep-alive
//! emitter never interleave partial frames.

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;
use std::sync::Arc;

/// Terminal sentinel frame
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Keep-alive comment frame, ignored by clients
pub const PING_FRAME: &[u8] = b": PING\n\n";

/// Frame one event-stream payload
#[must_use]
pub fn data_frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Head of an event-stream response
    #[must_use]
    pub fn event_stream() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        Self {
            status: StatusCode::OK,
            headers,
        }
    }

    /// Head of a JSON response
    #[must_use]
    pub fn json(status: StatusCode) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self { status, headers }
    }
}

/// Response write failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum WriteError {
    /// The client went away
    #[error("client disconnected")]
    Closed,
    /// Any other write failure
    #[error("write failed: {0}")]
    Failed(String),
}

/// Sink for one response
#[async_trait]
pub trait ResponseWriter: Send {
    /// Send the status and headers; only the first call has effect.
    ///
    /// Returns `false` when a head was already sent.
    fn send_head(&mut self, head: ResponseHead) -> bool;

    /// A head has been sent
    fn head_sent(&self) -> bool;

    /// Write body bytes
    async fn write(&mut self, chunk: Bytes) -> Result<(), WriteError>;

    /// Push buffered bytes to the client
    async fn flush(&mut self) -> Result<(), WriteError>;

    /// Send event-stream headers once per response
    fn set_event_stream_headers(&mut self) -> bool {
        self.send_head(ResponseHead::event_stream())
    }

    /// Write one `data:` frame
    async fn write_data(&mut self, payload: &str) -> Result<(), WriteError> {
        self.write(data_frame(payload)).await
    }

    /// Write the terminal sentinel and flush
    async fn write_done(&mut self) -> Result<(), WriteError> {
        self.write(Bytes::from_static(DONE_FRAME)).await?;
        self.flush().await
    }

    /// Write a keep-alive comment and flush
    async fn write_ping(&mut self) -> Result<(), WriteError> {
        self.write(Bytes::from_static(PING_FRAME)).await?;
        self.flush().await
    }

    /// Send a complete JSON response
    async fn write_json(
        &mut self,
        status: StatusCode,
        body: &serde_json::Value,
    ) -> Result<(), WriteError> {
        self.send_head(ResponseHead::json(status));
        let bytes = serde_json::to_vec(body).map_err(|e| WriteError::Failed(e.to_string()))?;
        self.write(Bytes::from(bytes)).await?;
        self.flush().await
    }
}

/// Writer shared by everything producing one response
pub type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn ResponseWriter>>>;

/// Wrap a writer for sharing
pub fn shared<W: ResponseWriter + 'static>(writer: W) -> SharedWriter {
    Arc::new(tokio::sync::Mutex::new(Box::new(writer)))
}

#[derive(Debug, Default)]
struct MemoryState {
    head: Option<ResponseHead>,
    head_writes: usize,
    body: Vec<u8>,
    flushes: usize,
    writes: usize,
    fail_after: Option<usize>,
}

/// In-memory writer; clones observe the same response
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryWriter {
    /// Create an empty writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write after `writes` successful ones
    #[must_use]
    pub fn failing_after(self, writes: usize) -> Self {
        self.state.lock().fail_after = Some(writes);
        self
    }

    /// Head that was sent
    #[must_use]
    pub fn head(&self) -> Option<ResponseHead> {
        self.state.lock().head.clone()
    }

    /// Number of heads actually sent
    #[must_use]
    pub fn head_writes(&self) -> usize {
        self.state.lock().head_writes
    }

    /// Number of flushes
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    /// Body written so far
    #[must_use]
    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().body).into_owned()
    }

    /// Body split into event-stream frames
    #[must_use]
    pub fn frames(&self) -> Vec<String> {
        self.body()
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl ResponseWriter for MemoryWriter {
    fn send_head(&mut self, head: ResponseHead) -> bool {
        let mut state = self.state.lock();
        if state.head.is_some() {
            return false;
        }
        state.head = Some(head);
        state.head_writes += 1;
        true
    }

    fn head_sent(&self) -> bool {
        self.state.lock().head.is_some()
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), WriteError> {
        let mut state = self.state.lock();
        if state.fail_after.is_some_and(|limit| state.writes >= limit) {
            return Err(WriteError::Closed);
        }
        state.writes += 1;
        state.body.extend_from_slice(&chunk);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), WriteError> {
        self.state.lock().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_stream_headers_sent_once() {
        let memory = MemoryWriter::new();
        let mut writer = memory.clone();
        assert!(writer.set_event_stream_headers());
        assert!(!writer.set_event_stream_headers());
        assert_eq!(memory.head_writes(), 1);

        let head = memory.head().unwrap();
        assert_eq!(head.headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(head.headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(head.headers["x-accel-buffering"], "no");
    }

    #[tokio::test]
    async fn test_framing() {
        let memory = MemoryWriter::new();
        let mut writer = memory.clone();
        writer.write_data(r#"{"a":1}"#).await.unwrap();
        writer.write_ping().await.unwrap();
        writer.write_done().await.unwrap();

        assert_eq!(
            memory.body(),
            "data: {\"a\":1}\n\n: PING\n\ndata: [DONE]\n\n"
        );
        assert_eq!(memory.frames().len(), 3);
    }

    #[tokio::test]
    async fn test_json_response_after_stream_head_keeps_first_head() {
        let memory = MemoryWriter::new();
        let mut writer = memory.clone();
        writer.set_event_stream_headers();
        writer
            .write_json(StatusCode::BAD_GATEWAY, &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(memory.head().unwrap().status, StatusCode::OK);
        assert_eq!(memory.head_writes(), 1);
    }

    #[tokio::test]
    async fn test_failing_writer() {
        let mut writer = MemoryWriter::new().failing_after(1);
        writer.write_data("one").await.unwrap();
        assert!(matches!(
            writer.write_data("two").await,
            Err(WriteError::Closed)
        ));
    }
}
