//! Rate limiting and admission control for LLM and embedding providers.
//!
//! The pieces, leaves first:
//! - [`LeakyBucket`] bounds one quantity (requests or tokens) per rolling minute.
//! - [`RequestAdmissionControl`] gates on a request ceiling and a token ceiling
//!   together, serving waiting callers fairly by `(penalty, arrival)`.
//! - [`ProviderLimiterRegistry`] owns one bucket pair and admission control per
//!   provider, applies a 90% safety margin, and keeps a provider-wide backoff
//!   window that every caller honours after a rate-limit signal.
//! - [`ProviderGate`] wraps provider calls with cost estimation, capacity
//!   acquisition, and classification-driven retry.
//!
//! Every waiting operation exists in an async form (suspends the task) and a
//! blocking form (parks the thread); both follow the same queueing rules.
//!
//! Limits come from [`RateLimitConfig`], loaded per provider through
//! [`TollgateConfig`] or observed from response headers with
//! [`HeaderRateLimitDetector`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod admission;
mod backoff;
mod bucket;
mod config;
mod detector;
mod gate;
mod queue;
mod registry;
mod window;

pub use admission::{RequestAdmissionControl, WindowUsage};
pub use backoff::{BackoffSchedule, backoff_delay};
pub use bucket::LeakyBucket;
pub use config::{
    MAX_ATTEMPT_TIMEOUT, RateLimitConfig, RateLimitConfigBuilder, SAFETY_THRESHOLD,
    TollgateConfig,
};
pub use detector::{DetectedLimits, HeaderRateLimitDetector};
pub use gate::ProviderGate;
pub use queue::{DEFAULT_REQUEUE_INTERVAL, DEFAULT_WINDOW, QueueItem, QueueSettings};
pub use registry::{ProviderLimiterRegistry, ProviderLimiters};
