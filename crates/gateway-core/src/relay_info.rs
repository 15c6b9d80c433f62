//! Per-request relay record.

use crate::channel::Channel;
use crate::types::{CallerIdentity, RequestId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How a model is priced
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PricingBasis {
    /// Token-metered: cost scales with prompt and completion tokens
    Ratio {
        /// Model ratio
        model_ratio: f64,
        /// Completion tokens are charged at this multiple of prompt tokens
        completion_ratio: f64,
        /// Group discount ratio
        group_ratio: f64,
    },
    /// Flat price per call, in currency units
    Fixed {
        /// Price per call
        price: f64,
        /// Group discount ratio
        group_ratio: f64,
    },
}

impl PricingBasis {
    /// Group ratio applied to either basis
    #[must_use]
    pub fn group_ratio(&self) -> f64 {
        match self {
            Self::Ratio { group_ratio, .. } | Self::Fixed { group_ratio, .. } => *group_ratio,
        }
    }
}

/// Everything one relay attempt knows about itself.
///
/// Created at request entry and owned by that request's task; never shared.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    /// Request identifier
    pub request_id: RequestId,
    /// Authenticated caller
    pub caller: CallerIdentity,
    /// Model the caller asked for
    pub origin_model: String,
    /// Model sent upstream after channel mapping
    pub upstream_model: String,
    /// Selected channel
    pub channel: Arc<Channel>,
    /// Pricing basis for the upstream model
    pub pricing: PricingBasis,
    /// Caller asked for a streamed response
    pub is_stream: bool,
    /// Prompt token estimate, used when upstream reports none
    pub prompt_tokens_estimate: u32,
    /// Request entry time
    pub start_time: Instant,
    /// First accepted upstream frame
    pub first_response_at: Option<Instant>,
}

impl RelayInfo {
    /// Create a relay record starting now
    pub fn new(
        request_id: RequestId,
        caller: CallerIdentity,
        origin_model: impl Into<String>,
        channel: Arc<Channel>,
        pricing: PricingBasis,
    ) -> Self {
        let origin_model = origin_model.into();
        let upstream_model = channel.map_model(&origin_model);
        Self {
            request_id,
            caller,
            origin_model,
            upstream_model,
            channel,
            pricing,
            is_stream: false,
            prompt_tokens_estimate: 0,
            start_time: Instant::now(),
            first_response_at: None,
        }
    }

    /// Mark the request as streamed
    #[must_use]
    pub fn with_stream(mut self, is_stream: bool) -> Self {
        self.is_stream = is_stream;
        self
    }

    /// Set the prompt token estimate
    #[must_use]
    pub fn with_prompt_tokens_estimate(mut self, tokens: u32) -> Self {
        self.prompt_tokens_estimate = tokens;
        self
    }

    /// Record the first response; later calls keep the first value
    pub fn set_first_response_time(&mut self, at: Instant) {
        if self.first_response_at.is_none() {
            self.first_response_at = Some(at);
        }
    }

    /// Time from request entry to the first accepted frame
    #[must_use]
    pub fn first_byte_latency(&self) -> Option<Duration> {
        self.first_response_at
            .map(|at| at.saturating_duration_since(self.start_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderType;

    fn info() -> RelayInfo {
        let channel = Arc::new(
            Channel::new(1, ProviderType::OpenAI, "k").with_model_mapping("gpt-4", "gpt-4o"),
        );
        RelayInfo::new(
            RequestId::generate(),
            CallerIdentity::new(1, 1),
            "gpt-4",
            channel,
            PricingBasis::Ratio {
                model_ratio: 15.0,
                completion_ratio: 2.0,
                group_ratio: 1.0,
            },
        )
    }

    #[test]
    fn test_upstream_model_is_mapped() {
        let info = info();
        assert_eq!(info.origin_model, "gpt-4");
        assert_eq!(info.upstream_model, "gpt-4o");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_response_time_sticks() {
        let mut info = info();
        assert!(info.first_byte_latency().is_none());

        tokio::time::advance(Duration::from_millis(250)).await;
        info.set_first_response_time(Instant::now());
        tokio::time::advance(Duration::from_millis(250)).await;
        info.set_first_response_time(Instant::now());

        assert_eq!(info.first_byte_latency(), Some(Duration::from_millis(250)));
    }
}
