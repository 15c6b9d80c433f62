//! # Gateway Providers
//!
//! Upstream adaptors for the relay gateway.
//!
//! This crate provides:
//! - The OpenAI-compatible adaptor (OpenAI, DeepSeek, OpenRouter, Xinference,
//!   custom endpoints)
//! - Azure OpenAI deployments, behind the `azure` feature
//! - The pooled HTTP client and default adaptor registration

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod openai;
pub mod registry;

// Re-export main types
pub use client::{build_client, ClientPool};
pub use openai::{Flavor, OpenAICompatibleAdaptor, DEFAULT_API_VERSION};
pub use registry::{default_base_url, default_registry, OPENAI_COMPATIBLE};
