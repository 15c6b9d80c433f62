//! Test doubles shared by the relay's unit tests.

use crate::adaptor::{Adaptor, RelayOutput, Translation, UpstreamRequest, UpstreamResponse};
use crate::stream::FrameHandler;
use crate::writer::ResponseWriter;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use gateway_core::{
    CallerIdentity, Channel, ChatRequest, GatewayError, GatewayResult, PricingBasis, ProviderType,
    RelayInfo, RequestId, Usage,
};
use http::StatusCode;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Relay record for channel 1 with unit pricing
pub(crate) fn relay_info() -> RelayInfo {
    RelayInfo::new(
        RequestId::new("req-test"),
        CallerIdentity::new(1, 1),
        "gpt-4",
        Arc::new(Channel::new(1, ProviderType::OpenAI, "sk-test")),
        PricingBasis::Ratio {
            model_ratio: 1.0,
            completion_ratio: 1.0,
            group_ratio: 1.0,
        },
    )
}

#[derive(Debug, Clone)]
enum Script {
    Json { status: StatusCode, body: String },
    Stream { lines: Vec<String>, hang: bool },
    FailExecute(GatewayError),
    HangExecute,
    HangBody,
}

/// What a scripted adaptor observed
#[derive(Debug, Default)]
pub(crate) struct Observed {
    pub executions: AtomicUsize,
    pub upstream_model: Mutex<Option<String>>,
}

/// Adaptor replaying a canned upstream response
#[derive(Debug, Clone)]
pub(crate) struct ScriptedAdaptor {
    script: Script,
    observed: Arc<Observed>,
}

impl ScriptedAdaptor {
    /// 200 with a JSON body
    pub fn json(body: &str) -> Self {
        Self::new(Script::Json {
            status: StatusCode::OK,
            body: body.to_string(),
        })
    }

    /// Event stream of `lines`; `hang` keeps the body open afterwards
    pub fn stream(lines: &[&str], hang: bool) -> Self {
        Self::new(Script::Stream {
            lines: lines.iter().map(|l| (*l).to_string()).collect(),
            hang,
        })
    }

    /// Non-success status with a JSON body
    pub fn status(status: u16, body: &str) -> Self {
        Self::new(Script::Json {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
        })
    }

    /// Transport failure on execute
    pub fn failing_execute(error: GatewayError) -> Self {
        Self::new(Script::FailExecute(error))
    }

    /// Execute never returns
    pub fn hang_execute() -> Self {
        Self::new(Script::HangExecute)
    }

    /// 200 whose body never arrives
    pub fn hang_body() -> Self {
        Self::new(Script::HangBody)
    }

    fn new(script: Script) -> Self {
        Self {
            script,
            observed: Arc::new(Observed::default()),
        }
    }

    /// Shared observation handle
    pub fn observed(&self) -> Arc<Observed> {
        Arc::clone(&self.observed)
    }
}

fn usage_of(value: &serde_json::Value) -> Option<Usage> {
    value
        .get("usage")
        .filter(|u| !u.is_null())
        .and_then(|u| serde_json::from_value(u.clone()).ok())
}

struct Forward {
    usage: Usage,
}

#[async_trait]
impl FrameHandler for Forward {
    async fn on_frame(&mut self, data: &str, writer: &mut dyn ResponseWriter) -> ControlFlow<()> {
        if let Some(usage) = serde_json::from_str(data).ok().as_ref().and_then(usage_of) {
            self.usage = usage;
        }
        match writer.write_data(data).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

#[async_trait]
impl Adaptor for ScriptedAdaptor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn init(&mut self, _info: &RelayInfo) -> GatewayResult<()> {
        Ok(())
    }

    fn build_request(
        &self,
        info: &RelayInfo,
        _request: &ChatRequest,
    ) -> GatewayResult<UpstreamRequest> {
        *self.observed.upstream_model.lock() = Some(info.upstream_model.clone());
        Ok(UpstreamRequest::post("http://scripted/v1/chat/completions", Bytes::new()))
    }

    async fn execute(&self, _request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
        self.observed.executions.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::FailExecute(e) => Err(e.clone()),
            Script::HangExecute => std::future::pending().await,
            Script::HangBody => Ok(UpstreamResponse::new(
                StatusCode::OK,
                stream::pending().boxed(),
            )),
            Script::Json { status, body } => {
                let chunk: GatewayResult<Bytes> = Ok(Bytes::from(body.clone()));
                Ok(UpstreamResponse::new(*status, Box::pin(stream::iter(vec![chunk]))))
            }
            Script::Stream { lines, hang } => {
                let chunks: Vec<GatewayResult<Bytes>> = lines
                    .iter()
                    .map(|l| Ok(Bytes::from(format!("{l}\n"))))
                    .collect();
                let head = stream::iter(chunks);
                let body = if *hang {
                    head.chain(stream::pending()).boxed()
                } else {
                    head.boxed()
                };
                Ok(UpstreamResponse::new(StatusCode::OK, body))
            }
        }
    }

    async fn translate_response(
        &mut self,
        response: UpstreamResponse,
        info: &mut RelayInfo,
        output: &RelayOutput,
    ) -> Translation {
        if info.is_stream {
            let mut handler = Forward {
                usage: Usage::default(),
            };
            let outcome = output
                .pipeline
                .run(response.body, &output.writer, &mut handler, info)
                .await;
            if outcome.is_done() {
                let _ = output.writer.lock().await.write_done().await;
            }
            return Translation::completed(handler.usage).with_stream(outcome);
        }

        let body = match response.read_body(1 << 20).await {
            Ok(body) => body,
            Err(e) => return Translation::failed(Usage::default(), e),
        };
        let value: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return Translation::failed(Usage::default(), GatewayError::translation(e.to_string())),
        };
        info.set_first_response_time(tokio::time::Instant::now());
        let usage = usage_of(&value).unwrap_or_default();
        match output.writer.lock().await.write_json(StatusCode::OK, &value).await {
            Ok(()) => Translation::completed(usage),
            Err(e) => Translation::failed(usage, GatewayError::internal(e.to_string())),
        }
    }
}
