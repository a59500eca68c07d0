//! Tollgate - rate limiting and admission control for LLM provider clients
//!
//! Tollgate sits between provider clients (chat completion, embedding,
//! reranking APIs) and the network. Every call goes through a per-provider
//! gate that reserves request and token capacity, queues callers fairly when
//! a provider's per-minute limits are exhausted, and backs off for every
//! caller once the provider starts throttling.
//!
//! # Features
//!
//! - **Rolling-window limits**: requests and tokens per minute, with a 90% safety margin
//! - **Fair queuing**: waiting callers served by penalty, then arrival
//! - **Shared backoff**: one 429 pauses every caller of that provider
//! - **Classified retry**: authentication and invalid-request failures are never retried
//! - **Async and blocking**: every waiting operation exists in both forms
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use tollgate::{HttpError, Message, ProviderGate, ProviderLimiterRegistry, RateLimitConfig, Role};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ProviderLimiterRegistry::new());
//! let gate = ProviderGate::new(registry, "anthropic", RateLimitConfig::with_limits(50, 40_000));
//!
//! let messages = vec![Message::text(Role::User, "Hello, world!")];
//! let reply = gate
//!     .call(&messages, || async { Ok::<_, HttpError>("Hi!".to_string()) })
//!     .await?;
//! assert_eq!(reply, "Hi!");
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - `tollgate_error` - Error types and failure classification
//! - `tollgate_core` - Messages, token usage and cost estimation
//! - `tollgate_rate_limit` - Buckets, admission control, registry, retry wrapper
//!
//! This crate re-exports everything for convenience.

pub use tollgate_core::*;
pub use tollgate_error::*;
pub use tollgate_rate_limit::*;
