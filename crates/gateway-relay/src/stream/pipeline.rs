use super::{parse_frame, ByteStream, Frame, LineScanner, ScannerLimits, StreamOutcome, StreamState};
use crate::writer::{ResponseWriter, SharedWriter};
use async_trait::async_trait;
use gateway_config::StreamingConfig;
use gateway_core::{GatewayError, RelayInfo};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives each accepted data frame.
///
/// Called with the shared writer already locked; the pipeline flushes after
/// every call.
#[async_trait]
pub trait FrameHandler: Send {
    /// Handle one payload; `Break` ends the stream
    async fn on_frame(&mut self, data: &str, writer: &mut dyn ResponseWriter) -> ControlFlow<()>;
}

/// Per-stream timing and buffer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Longest gap between upstream lines
    pub idle_timeout: Duration,
    /// Keep-alive interval; `None` disables pings
    pub ping_interval: Option<Duration>,
    /// Scanner buffer sizes
    pub limits: ScannerLimits,
}

impl Default for StreamSettings {
    fn default() -> Self {
        let config = StreamingConfig::default();
        Self {
            idle_timeout: config.idle_timeout,
            ping_interval: None,
            limits: ScannerLimits::from(&config),
        }
    }
}

impl StreamSettings {
    /// Settings for a stream of `upstream_model`; slow models get a longer
    /// idle timeout
    #[must_use]
    pub fn for_model(config: &StreamingConfig, upstream_model: &str) -> Self {
        Self {
            idle_timeout: config.idle_timeout_for(upstream_model),
            ping_interval: config.ping_enabled.then_some(config.ping_interval),
            limits: ScannerLimits::from(config),
        }
    }

    /// Set the idle timeout
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the keep-alive interval
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the scanner limits
    #[must_use]
    pub fn with_limits(mut self, limits: ScannerLimits) -> Self {
        self.limits = limits;
        self
    }
}

enum Event {
    Stopped,
    Idle,
    Line(Option<gateway_core::GatewayResult<String>>),
}

/// Drives one upstream event stream to a terminal state
#[derive(Debug, Clone)]
pub struct StreamPipeline {
    settings: StreamSettings,
    cancel: CancellationToken,
}

impl StreamPipeline {
    /// Create a pipeline
    #[must_use]
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort the stream when `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Settings in use
    #[must_use]
    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Stream `body` through `handler` into `writer`.
    ///
    /// Headers are sent once, the writer is flushed after every handled frame
    /// and once more on every exit path, and the keep-alive task is stopped
    /// before returning.
    pub async fn run<H>(
        &self,
        body: ByteStream,
        writer: &SharedWriter,
        handler: &mut H,
        info: &mut RelayInfo,
    ) -> StreamOutcome
    where
        H: FrameHandler + ?Sized,
    {
        let mut outcome = StreamOutcome::open();
        writer.lock().await.set_event_stream_headers();

        let stop = self.cancel.child_token();
        let keep_alive = self
            .settings
            .ping_interval
            .map(|every| spawn_keep_alive(writer.clone(), every, stop.clone()));

        let idle_timeout = self.settings.idle_timeout;
        let mut scanner = LineScanner::new(body, self.settings.limits);
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);
        outcome.state = StreamState::Streaming;

        loop {
            let event = tokio::select! {
                biased;
                () = stop.cancelled() => Event::Stopped,
                () = &mut idle => Event::Idle,
                line = scanner.next_line() => Event::Line(line),
            };

            let line = match event {
                Event::Stopped => {
                    let error = if self.cancel.is_cancelled() {
                        GatewayError::Cancelled
                    } else {
                        GatewayError::internal("keep-alive write failed")
                    };
                    outcome.finish(StreamState::Error, Some(error));
                    break;
                }
                Event::Idle => {
                    warn!(
                        request_id = %info.request_id,
                        channel_id = info.channel.id,
                        idle_secs = idle_timeout.as_secs(),
                        "Streaming timeout"
                    );
                    outcome.finish(
                        StreamState::Timeout,
                        Some(GatewayError::StreamTimeout { idle: idle_timeout }),
                    );
                    break;
                }
                Event::Line(None) => {
                    outcome.finish(StreamState::Done, None);
                    break;
                }
                Event::Line(Some(Err(e))) => {
                    warn!(request_id = %info.request_id, error = %e, "Upstream stream failed");
                    outcome.finish(StreamState::Error, Some(e));
                    break;
                }
                Event::Line(Some(Ok(line))) => line,
            };

            idle.as_mut().reset(Instant::now() + idle_timeout);

            let data = match parse_frame(&line) {
                None => continue,
                Some(Frame::Done) => {
                    outcome.finish(StreamState::Done, None);
                    break;
                }
                Some(Frame::Data(data)) => data,
            };

            let (flow, flushed) = {
                let mut guard = writer.lock().await;
                let flow = handler.on_frame(data, &mut **guard).await;
                (flow, guard.flush().await)
            };

            outcome.frames += 1;
            if outcome.frames == 1 {
                let now = Instant::now();
                outcome.first_frame_at = Some(now);
                info.set_first_response_time(now);
                outcome.buffer_grown = scanner.grow();
            }

            if let Err(e) = flushed {
                debug!(request_id = %info.request_id, error = %e, "Client write failed");
                outcome.finish(StreamState::Error, Some(GatewayError::internal(e.to_string())));
                break;
            }
            if flow.is_break() {
                outcome.finish(StreamState::Done, None);
                break;
            }
        }

        stop.cancel();
        if let Some(task) = keep_alive {
            if let Err(e) = task.await {
                warn!(error = %e, "Keep-alive task panicked");
            }
        }

        if let Err(e) = writer.lock().await.flush().await {
            debug!(request_id = %info.request_id, error = %e, "Final flush failed");
        }

        info!(
            request_id = %info.request_id,
            state = outcome.state.as_str(),
            frames = outcome.frames,
            "Streaming finished"
        );
        outcome
    }
}

fn spawn_keep_alive(
    writer: SharedWriter,
    every: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let result = writer.lock().await.write_ping().await;
                    if let Err(e) = result {
                        warn!(error = %e, "Ping failed, aborting stream");
                        stop.cancel();
                        break;
                    }
                }
            }
        }
    })
}
