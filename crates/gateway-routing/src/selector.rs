//! Weighted random channel selection.
//!
//! Every channel contributes `weight + 1` slots to the draw, so a weight-zero
//! channel is picked rarely but never starved. If the draw cannot be mapped
//! onto a channel the selector falls back to a round-robin cursor.

use gateway_core::Channel;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Uniform integer source, injectable for deterministic tests
pub trait RandomSource: Send + Sync {
    /// Uniform integer in `[0, upper)`; `upper` is never zero
    fn draw(&self, upper: u64) -> u64;
}

/// Thread-local RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn draw(&self, upper: u64) -> u64 {
        rand::thread_rng().gen_range(0..upper)
    }
}

/// Weighted random selector with round-robin fallback
pub struct WeightedSelector {
    random: Arc<dyn RandomSource>,
    cursor: AtomicUsize,
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WeightedSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedSelector")
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WeightedSelector {
    /// Selector backed by the thread RNG
    #[must_use]
    pub fn new() -> Self {
        Self::with_random(Arc::new(ThreadRandom))
    }

    /// Selector backed by `random`
    #[must_use]
    pub fn with_random(random: Arc<dyn RandomSource>) -> Self {
        Self {
            random,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick one channel, `None` only when `channels` is empty
    pub fn pick<'a>(&self, channels: &'a [Arc<Channel>]) -> Option<&'a Arc<Channel>> {
        if channels.is_empty() {
            return None;
        }

        let total: u64 = channels.iter().map(|c| u64::from(c.weight) + 1).sum();
        let mut remainder = self.random.draw(total);

        for channel in channels {
            let slots = u64::from(channel.weight) + 1;
            if remainder < slots {
                return Some(channel);
            }
            remainder -= slots;
        }

        warn!(
            total = total,
            channels = channels.len(),
            "Weighted draw out of range, using round-robin"
        );
        self.next(channels)
    }

    /// Next channel in round-robin order
    pub fn next<'a>(&self, channels: &'a [Arc<Channel>]) -> Option<&'a Arc<Channel>> {
        if channels.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % channels.len();
        channels.get(index)
    }
}
