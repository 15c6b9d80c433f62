//! # Gateway Relay
//!
//! Request relay engine for the gateway.
//!
//! This crate provides:
//! - The provider adaptor contract and a registry of adaptor factories
//! - An SSE pipeline with idle timeout, keep-alive pings and buffer growth
//! - The lifecycle orchestrator that reserves, dispatches and settles

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adaptor;
pub mod error;
pub mod orchestrator;
pub mod stream;
pub mod writer;

#[cfg(test)]
mod testing;

// Re-export main types
pub use adaptor::{
    Adaptor, AdaptorFactory, AdaptorRegistry, RelayOutput, Translation, UpstreamRequest,
    UpstreamResponse,
};
pub use error::{error_body, upstream_error, RelayError};
pub use orchestrator::{QuotaOutcome, RelayEngine, RelayReport, RelayRequest};
pub use stream::{
    parse_frame, ByteStream, Frame, FrameHandler, LineScanner, ScannerLimits, StreamOutcome,
    StreamPipeline, StreamSettings, StreamState,
};
pub use writer::{
    data_frame, shared, MemoryWriter, ResponseHead, ResponseWriter, SharedWriter, WriteError,
    DONE_FRAME, PING_FRAME,
};
