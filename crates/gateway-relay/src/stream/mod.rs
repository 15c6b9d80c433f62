//! Streaming response pipeline.
//!
//! An upstream event stream is split into lines, data frames are picked out
//! and handed to a [`FrameHandler`], and the outcome is reported as a
//! terminal [`StreamState`].

mod pipeline;
mod scanner;

pub use pipeline::{FrameHandler, StreamPipeline, StreamSettings};
pub use scanner::{LineScanner, ScannerLimits};

use bytes::Bytes;
use futures::stream::BoxStream;
use gateway_core::GatewayError;
use tokio::time::Instant;

/// Raw upstream body
pub type ByteStream = BoxStream<'static, Result<Bytes, GatewayError>>;

/// One accepted line of an upstream event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Payload of a `data:` line, marker and leading spaces removed
    Data(&'a str),
    /// Terminal sentinel
    Done,
}

/// Classify one scanned line.
///
/// Lines shorter than six bytes and lines that are neither `data:` frames
/// nor the bare sentinel are ignored.
#[must_use]
pub fn parse_frame(line: &str) -> Option<Frame<'_>> {
    if line.len() < 6 {
        return None;
    }
    if line.starts_with("[DONE]") {
        return Some(Frame::Done);
    }
    let payload = line
        .strip_prefix("data:")?
        .trim_start_matches(' ')
        .trim_end_matches('\r');
    if payload.starts_with("[DONE]") {
        Some(Frame::Done)
    } else {
        Some(Frame::Data(payload))
    }
}

/// Stream state; the last three are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Headers sent, nothing read yet
    Open,
    /// Reading frames
    Streaming,
    /// Sentinel seen, end of body, or handler stopped
    Done,
    /// No line within the idle timeout
    Timeout,
    /// Upstream, write, keep-alive or cancellation failure
    Error,
}

impl StreamState {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Streaming => "streaming",
            Self::Done => "done",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    /// Stream has ended
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Timeout | Self::Error)
    }
}

/// What a finished stream did
#[derive(Debug)]
pub struct StreamOutcome {
    /// Terminal state
    pub state: StreamState,
    /// Frames handed to the handler
    pub frames: usize,
    /// When the first frame was handled
    pub first_frame_at: Option<Instant>,
    /// Scanner buffer was grown
    pub buffer_grown: bool,
    /// Failure behind a `Timeout` or `Error` state
    pub error: Option<GatewayError>,
}

impl StreamOutcome {
    fn open() -> Self {
        Self {
            state: StreamState::Open,
            frames: 0,
            first_frame_at: None,
            buffer_grown: false,
            error: None,
        }
    }

    fn finish(&mut self, state: StreamState, error: Option<GatewayError>) {
        self.state = state;
        self.error = error;
    }

    /// Ended with the sentinel or end of body
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == StreamState::Done
    }
}
