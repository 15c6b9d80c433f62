//! Request lifecycle.
//!
//! One relay is: pick a channel, reserve quota, dispatch through the
//! channel's adaptor, translate the response into the caller's writer, then
//! settle or refund exactly once and report the outcome to the registry.

use crate::adaptor::{Adaptor, AdaptorRegistry, RelayOutput, Translation, UpstreamResponse};
use crate::error::{error_body, upstream_error, RelayError};
use crate::stream::{StreamPipeline, StreamSettings, StreamState};
use crate::writer::SharedWriter;
use gateway_config::{StreamingConfig, UpstreamConfig};
use gateway_core::{
    estimate_tokens, CallerIdentity, ChannelId, ChatRequest, GatewayError, PricingBasis, RelayInfo,
    RequestId, Usage,
};
use gateway_quota::{Pricing, QuotaReservation, QuotaService, Settlement};
use gateway_routing::ChannelRegistry;
use gateway_telemetry::{LatencyMonitor, RelayMetrics, RequestOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Largest upstream error body read into a message
const MAX_ERROR_BODY: usize = 64 * 1024;

/// One caller request, already authenticated
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Request identifier
    pub request_id: RequestId,
    /// Authenticated caller
    pub caller: CallerIdentity,
    /// Canonical request body
    pub body: ChatRequest,
}

impl RelayRequest {
    /// Create a relay request
    #[must_use]
    pub fn new(request_id: RequestId, caller: CallerIdentity, body: ChatRequest) -> Self {
        Self {
            request_id,
            caller,
            body,
        }
    }
}

/// How the reservation was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    /// Reconciled against reported usage
    Settled(Settlement),
    /// Returned in full
    Refunded(i64),
}

/// Summary of a relay that reached dispatch
#[derive(Debug)]
pub struct RelayReport {
    /// Request identifier
    pub request_id: RequestId,
    /// Channel used
    pub channel_id: ChannelId,
    /// Model sent upstream
    pub upstream_model: String,
    /// Usage settled against
    pub usage: Usage,
    /// Settlement or refund
    pub quota: QuotaOutcome,
    /// Terminal stream state for streamed responses
    pub stream_state: Option<StreamState>,
    /// Failure after the response had started
    pub error: Option<GatewayError>,
    /// Time to the first upstream frame
    pub first_byte_latency: Option<Duration>,
}

/// Runs requests through channel selection, quota and an adaptor
pub struct RelayEngine {
    registry: Arc<ChannelRegistry>,
    adaptors: Arc<AdaptorRegistry>,
    quota: QuotaService,
    pricing: Arc<Pricing>,
    streaming: StreamingConfig,
    upstream: UpstreamConfig,
    metrics: Option<Arc<RelayMetrics>>,
    latency: Option<Arc<LatencyMonitor>>,
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("registry", &self.registry)
            .field("adaptors", &self.adaptors)
            .finish_non_exhaustive()
    }
}

impl RelayEngine {
    /// Create an engine
    #[must_use]
    pub fn new(
        registry: Arc<ChannelRegistry>,
        adaptors: Arc<AdaptorRegistry>,
        quota: QuotaService,
        pricing: Arc<Pricing>,
        streaming: StreamingConfig,
    ) -> Self {
        Self {
            registry,
            adaptors,
            quota,
            pricing,
            streaming,
            upstream: UpstreamConfig::default(),
            metrics: None,
            latency: None,
        }
    }

    /// Header and body deadlines for upstream calls
    #[must_use]
    pub fn with_upstream_config(mut self, upstream: UpstreamConfig) -> Self {
        self.upstream = upstream;
        self
    }

    /// Record Prometheus metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Track first-byte latency
    #[must_use]
    pub fn with_latency_monitor(mut self, monitor: Arc<LatencyMonitor>) -> Self {
        self.latency = Some(monitor);
        self
    }

    /// Channel registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Quota service
    #[must_use]
    pub fn quota(&self) -> &QuotaService {
        &self.quota
    }

    /// Relay one request, writing the caller's response into `writer`.
    ///
    /// Errors before any response bytes are returned for the caller to
    /// render. Once a head has been sent, failures are reported in the
    /// [`RelayReport`] and, for streams, as a final error frame.
    ///
    /// # Errors
    /// Returns `RelayError` when the request fails before the response starts
    #[instrument(
        skip(self, request, writer, cancel),
        fields(request_id = %request.request_id, model = %request.body.model)
    )]
    pub async fn relay(
        &self,
        request: RelayRequest,
        writer: SharedWriter,
        cancel: CancellationToken,
    ) -> Result<RelayReport, RelayError> {
        let request_id = request.request_id.clone();
        if let Some(latency) = &self.latency {
            latency.start(request_id.as_str());
        }

        let result = self.run(request, writer, cancel).await;

        if let Some(latency) = &self.latency {
            latency.finish(request_id.as_str());
        }
        result
    }

    async fn run(
        &self,
        request: RelayRequest,
        writer: SharedWriter,
        cancel: CancellationToken,
    ) -> Result<RelayReport, RelayError> {
        let RelayRequest {
            request_id,
            caller,
            body,
        } = request;

        body.validate().map_err(|e| self.rejected(None, &body.model, e))?;

        let channel = self
            .registry
            .select_for_model(&body.model)
            .map_err(|e| self.rejected(None, &body.model, e))?;

        let mut adaptor = self
            .adaptors
            .create(&channel.provider_type)
            .map_err(|e| self.rejected(Some(channel.id), &body.model, e))?;

        let upstream_model = channel.map_model(&body.model);
        let basis = self.pricing.basis_for(&upstream_model, &caller.group);
        let prompt_tokens = estimate_tokens(&body.prompt_text());
        let assumed = self.pricing.assumed_tokens(prompt_tokens, body.max_tokens);
        let estimate = self.pricing.estimate(&basis, assumed);

        let reservation = self
            .quota
            .reserve(&caller, estimate)
            .await
            .map_err(|e| self.rejected(Some(channel.id), &body.model, e))?;

        let mut info = RelayInfo::new(request_id, caller, body.model.clone(), Arc::clone(&channel), basis)
            .with_stream(body.stream)
            .with_prompt_tokens_estimate(prompt_tokens);

        debug!(
            channel_id = channel.id,
            adaptor = adaptor.name(),
            upstream_model = %info.upstream_model,
            estimate = estimate,
            "Dispatching"
        );

        let deadline = self
            .upstream
            .relay_timeout
            .filter(|_| !info.is_stream)
            .map(|limit| (Instant::now() + limit, limit));

        let response = match self.dispatch(adaptor.as_mut(), &info, &body, &cancel).await {
            Ok(response) => response,
            Err(e) => {
                let refunded = reservation.refund();
                if let Some(metrics) = &self.metrics {
                    metrics.record_refunded();
                }
                if matches!(e, GatewayError::Upstream { .. } | GatewayError::UpstreamTimeout { .. }) {
                    self.registry.report(channel.id, false);
                }
                self.record(channel.id, &info.upstream_model, RequestOutcome::Failed);
                warn!(
                    channel_id = channel.id,
                    refunded = refunded,
                    error = %e,
                    "Relay failed before response"
                );
                return Err(RelayError::for_channel(e, &channel));
            }
        };

        let settings = StreamSettings::for_model(&self.streaming, &info.upstream_model);
        let output = RelayOutput {
            writer: writer.clone(),
            pipeline: StreamPipeline::new(settings).with_cancellation(cancel.clone()),
        };
        let is_stream = info.is_stream;
        let translate = adaptor.translate_response(response, &mut info, &output);
        let translation = if is_stream {
            translate.await
        } else {
            bounded(translate, &cancel, deadline).await
        };

        let quota = self.close(reservation, &info, &translation);
        let success = translation.error.is_none();
        if !matches!(translation.error, Some(GatewayError::Cancelled)) {
            self.registry.report(channel.id, success);
        }

        let outcome = if success {
            RequestOutcome::Success
        } else {
            RequestOutcome::Failed
        };
        self.record(channel.id, &info.upstream_model, outcome);

        let first_byte_latency = info.first_byte_latency();
        if let Some(latency) = first_byte_latency {
            if let Some(metrics) = &self.metrics {
                metrics.record_first_byte(latency);
            }
            if let Some(monitor) = &self.latency {
                monitor.record_first_byte(info.request_id.as_str(), latency);
            }
        }
        let stream_state = translation.stream.as_ref().map(|s| s.state);
        if let (Some(state), Some(metrics)) = (stream_state, &self.metrics) {
            metrics.record_stream_end(state.as_str());
        }

        let Translation { usage, error, .. } = translation;
        if let Some(e) = &error {
            let mut guard = writer.lock().await;
            if !guard.head_sent() {
                drop(guard);
                return Err(RelayError::for_channel(e.clone(), &channel));
            }
            if info.is_stream {
                let frame = error_body(e).to_string();
                if guard.write_data(&frame).await.is_ok() {
                    if let Err(e) = guard.flush().await {
                        debug!(request_id = %info.request_id, error = %e, "Error frame flush failed");
                    }
                }
            }
        }

        info!(
            channel_id = channel.id,
            upstream_model = %info.upstream_model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            stream_state = stream_state.map(StreamState::as_str),
            "Relay finished"
        );

        Ok(RelayReport {
            request_id: info.request_id,
            channel_id: channel.id,
            upstream_model: info.upstream_model,
            usage,
            quota,
            stream_state,
            error,
            first_byte_latency,
        })
    }

    async fn dispatch(
        &self,
        adaptor: &mut dyn Adaptor,
        info: &RelayInfo,
        body: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse, GatewayError> {
        adaptor.init(info)?;
        let upstream = adaptor.build_request(info, body)?;

        let limit = self.upstream.response_header_timeout;
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            result = tokio::time::timeout(limit, adaptor.execute(upstream)) => match result {
                Ok(response) => response?,
                Err(_) => {
                    return Err(GatewayError::UpstreamTimeout {
                        stage: "response headers",
                        after: limit,
                    })
                }
            },
        };
        if response.status.is_success() {
            return Ok(response);
        }

        let status = response.status.as_u16();
        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            body = tokio::time::timeout(limit, response.read_body(MAX_ERROR_BODY)) => {
                body.ok().and_then(Result::ok).unwrap_or_default()
            }
        };
        Err(upstream_error(status, &body))
    }

    /// Settle against reported usage, or refund when none was reported.
    ///
    /// A fixed-price call that completed is charged its price even when the
    /// upstream reported no usage.
    fn close(
        &self,
        reservation: QuotaReservation,
        info: &RelayInfo,
        translation: &Translation,
    ) -> QuotaOutcome {
        let per_call =
            translation.error.is_none() && matches!(info.pricing, PricingBasis::Fixed { .. });
        if translation.usage.is_empty() && !per_call {
            let refunded = reservation.refund();
            if let Some(metrics) = &self.metrics {
                metrics.record_refunded();
            }
            return QuotaOutcome::Refunded(refunded);
        }

        let actual = self.pricing.cost(&info.pricing, &translation.usage);
        let settlement = reservation.settle(actual, info.channel.id);
        if let Some(metrics) = &self.metrics {
            metrics.record_settled();
        }
        QuotaOutcome::Settled(settlement)
    }

    fn rejected(&self, channel_id: Option<ChannelId>, model: &str, error: GatewayError) -> RelayError {
        debug!(model = %model, error = %error, "Relay rejected");
        self.record(channel_id.unwrap_or(0), model, RequestOutcome::Rejected);
        RelayError::new(error)
    }

    fn record(&self, channel_id: ChannelId, model: &str, outcome: RequestOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.record_request(channel_id, model, outcome);
        }
    }
}

/// Run a non-streamed translation until it finishes, the caller goes away
/// or the relay deadline passes
async fn bounded<F>(
    translate: F,
    cancel: &CancellationToken,
    deadline: Option<(Instant, Duration)>,
) -> Translation
where
    F: Future<Output = Translation>,
{
    let expired = async {
        match deadline {
            Some((at, _)) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        () = cancel.cancelled() => Translation::failed(Usage::default(), GatewayError::Cancelled),
        () = expired => Translation::failed(
            Usage::default(),
            GatewayError::UpstreamTimeout {
                stage: "response body",
                after: deadline.map_or(Duration::ZERO, |(_, limit)| limit),
            },
        ),
        translation = translate => translation,
    }
}
