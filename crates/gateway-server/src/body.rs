//! Channel-backed response writer.
//!
//! The relay runs in its own task and writes through [`ChannelWriter`]. The
//! handler waits for the head, then streams the body channel to the client.
//! Dropping the response body cancels the relay, which is how a client
//! disconnect reaches the streaming pipeline.

use axum::body::Body;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use gateway_relay::{RelayError, RelayReport, ResponseHead, ResponseWriter, WriteError};
use std::convert::Infallible;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;
use tracing::{debug, error};

use crate::error::ApiError;

/// Chunks buffered between the relay and the client
pub const BODY_CHANNEL_CAPACITY: usize = 64;

type Chunk = Result<Bytes, Infallible>;

/// Writer half, owned by the relay task
#[derive(Debug)]
pub struct ChannelWriter {
    head: Option<oneshot::Sender<ResponseHead>>,
    head_sent: bool,
    body: mpsc::Sender<Chunk>,
    buffer: BytesMut,
}

/// Reader half, owned by the handler
#[derive(Debug)]
pub struct PendingResponse {
    head: oneshot::Receiver<ResponseHead>,
    body: mpsc::Receiver<Chunk>,
}

/// Create a connected writer and pending response
#[must_use]
pub fn channel_writer(capacity: usize) -> (ChannelWriter, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(capacity.max(1));
    (
        ChannelWriter {
            head: Some(head_tx),
            head_sent: false,
            body: body_tx,
            buffer: BytesMut::new(),
        },
        PendingResponse {
            head: head_rx,
            body: body_rx,
        },
    )
}

#[async_trait::async_trait]
impl ResponseWriter for ChannelWriter {
    fn send_head(&mut self, head: ResponseHead) -> bool {
        if self.head_sent {
            return false;
        }
        self.head_sent = true;
        if let Some(tx) = self.head.take() {
            // A dropped receiver shows up as Closed on the next flush
            let _ = tx.send(head);
        }
        true
    }

    fn head_sent(&self) -> bool {
        self.head_sent
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), WriteError> {
        if self.body.is_closed() {
            return Err(WriteError::Closed);
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), WriteError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        self.body
            .send(Ok(chunk))
            .await
            .map_err(|_| WriteError::Closed)
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            let chunk = self.buffer.split().freeze();
            if self.body.try_send(Ok(chunk)).is_err() {
                debug!("Dropped unflushed response bytes");
            }
        }
    }
}

impl PendingResponse {
    /// Wait for the relay to produce a head and stream the body.
    ///
    /// When the relay ends without sending a head its error is rendered
    /// instead. `guard` cancels the relay when the response is dropped.
    ///
    /// # Errors
    /// Returns the relay's error when no response was started
    pub async fn into_response(
        self,
        task: JoinHandle<Result<RelayReport, RelayError>>,
        guard: DropGuard,
    ) -> Result<Response, ApiError> {
        let Self { head, body } = self;

        match head.await {
            Ok(head) => {
                let stream = ReceiverStream::new(body).map(move |chunk| {
                    let _ = &guard;
                    chunk
                });
                let mut response = Response::new(Body::from_stream(stream));
                *response.status_mut() = head.status;
                *response.headers_mut() = head.headers;
                Ok(response)
            }
            Err(_) => {
                drop(guard);
                match task.await {
                    Ok(Err(err)) => Err(err.into()),
                    Ok(Ok(report)) => {
                        error!(request_id = %report.request_id, "Relay finished without a response");
                        Err(ApiError::internal("relay produced no response"))
                    }
                    Err(join) => {
                        error!(error = %join, "Relay task failed");
                        Err(ApiError::internal("relay task failed"))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use gateway_core::GatewayError;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_head_then_body() {
        let (mut writer, pending) = channel_writer(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(async move {
            writer.set_event_stream_headers();
            writer.write_data("{\"a\":1}").await.unwrap();
            writer.flush().await.unwrap();
            writer.write_done().await.unwrap();
            Err(RelayError::new(GatewayError::internal("unused")))
        });

        let response = pending
            .into_response(task, cancel.clone().drop_guard())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_error_without_head() {
        let (writer, pending) = channel_writer(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(async move {
            drop(writer);
            Err(RelayError::new(GatewayError::NoChannelAvailable {
                model: "gpt-4".to_string(),
            }))
        });

        let err = pending
            .into_response(task, cancel.clone().drop_guard())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_body_closes_writer() {
        let (mut writer, pending) = channel_writer(1);
        writer.send_head(ResponseHead::json(StatusCode::OK));
        drop(pending);

        writer.write(Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(writer.head_sent());
        assert!(!writer.send_head(ResponseHead::json(StatusCode::OK)));
    }
}
