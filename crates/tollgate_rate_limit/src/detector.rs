//! Rate limit detection from API response headers.
//!
//! Providers report their actual limits on every response. Different
//! providers use different header conventions:
//! - Anthropic: `anthropic-ratelimit-{requests,tokens}-{limit,remaining}`
//! - OpenAI and Groq: `x-ratelimit-{limit,remaining}-{requests,tokens}`
//!
//! Detected limits are cached per provider and can seed a
//! [`RateLimitConfig`] for the registry.

use crate::RateLimitConfig;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Limits read from one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, derive_getters::Getters)]
pub struct DetectedLimits {
    /// Requests per minute limit
    requests_per_minute: Option<u64>,
    /// Tokens per minute limit
    tokens_per_minute: Option<u64>,
    /// Requests left in the provider's current window
    requests_remaining: Option<u64>,
    /// Tokens left in the provider's current window
    tokens_remaining: Option<u64>,
}

impl DetectedLimits {
    /// Whether any header was recognised.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// `config` with the detected per-minute limits substituted in.
    ///
    /// Retry policy and the `enabled` flag are kept from `config`.
    pub fn apply_to(&self, config: &RateLimitConfig) -> RateLimitConfig {
        let requests = self
            .requests_per_minute
            .unwrap_or(*config.requests_per_minute());
        let tokens = self
            .tokens_per_minute
            .unwrap_or(*config.tokens_per_minute());

        let mut builder = RateLimitConfig::builder();
        builder
            .requests_per_minute(requests)
            .tokens_per_minute(tokens)
            .enabled(*config.enabled())
            .max_retries(*config.max_retries())
            .initial_retry_delay(*config.initial_retry_delay())
            .max_retry_delay(*config.max_retry_delay())
            .jitter_factor(*config.jitter_factor());
        builder.build().unwrap_or_else(|_| config.clone())
    }
}

/// Detects and caches rate limits from API response headers.
///
/// # Example
///
/// ```
/// use reqwest::header::{HeaderMap, HeaderValue};
/// use tollgate_rate_limit::HeaderRateLimitDetector;
///
/// # #[tokio::main]
/// # async fn main() {
/// let detector = HeaderRateLimitDetector::new();
/// let mut headers = HeaderMap::new();
/// headers.insert("anthropic-ratelimit-requests-limit", HeaderValue::from_static("50"));
/// headers.insert("anthropic-ratelimit-tokens-limit", HeaderValue::from_static("40000"));
///
/// let limits = detector.detect("anthropic", &headers).await.unwrap();
/// assert_eq!(*limits.requests_per_minute(), Some(50));
/// assert_eq!(detector.cached("anthropic").await, Some(limits));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct HeaderRateLimitDetector {
    /// Last detected limits per provider
    detected: Arc<RwLock<HashMap<String, DetectedLimits>>>,
}

impl HeaderRateLimitDetector {
    /// Create a detector with an empty cache.
    #[instrument]
    pub fn new() -> Self {
        debug!("Creating new header rate limit detector");
        Self::default()
    }

    /// Detect limits using whichever header convention is present.
    ///
    /// Returns `None` (and leaves the cache alone) when no limit headers are
    /// recognised.
    #[instrument(skip(self, headers))]
    pub async fn detect(&self, provider: &str, headers: &HeaderMap) -> Option<DetectedLimits> {
        let limits = Some(Self::parse_anthropic(headers))
            .filter(|limits| !limits.is_empty())
            .or_else(|| Some(Self::parse_openai(headers)).filter(|limits| !limits.is_empty()))?;
        debug!(
            provider,
            rpm = ?limits.requests_per_minute,
            tpm = ?limits.tokens_per_minute,
            "Detected rate limits"
        );

        self.detected
            .write()
            .await
            .insert(provider.to_string(), limits);
        Some(limits)
    }

    /// Parse Anthropic's `anthropic-ratelimit-*` headers.
    pub fn parse_anthropic(headers: &HeaderMap) -> DetectedLimits {
        DetectedLimits {
            requests_per_minute: parse_header_u64(headers, "anthropic-ratelimit-requests-limit"),
            tokens_per_minute: parse_header_u64(headers, "anthropic-ratelimit-tokens-limit"),
            requests_remaining: parse_header_u64(
                headers,
                "anthropic-ratelimit-requests-remaining",
            ),
            tokens_remaining: parse_header_u64(headers, "anthropic-ratelimit-tokens-remaining"),
        }
    }

    /// Parse the OpenAI-style `x-ratelimit-*` headers (also used by Groq).
    pub fn parse_openai(headers: &HeaderMap) -> DetectedLimits {
        DetectedLimits {
            requests_per_minute: parse_header_u64(headers, "x-ratelimit-limit-requests"),
            tokens_per_minute: parse_header_u64(headers, "x-ratelimit-limit-tokens"),
            requests_remaining: parse_header_u64(headers, "x-ratelimit-remaining-requests"),
            tokens_remaining: parse_header_u64(headers, "x-ratelimit-remaining-tokens"),
        }
    }

    /// Delay requested by a `Retry-After` header given in seconds.
    ///
    /// HTTP-date values are not interpreted.
    pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
        let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
        let seconds: f64 = value.parse().ok()?;
        if !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(seconds).ok()
    }

    /// Last limits detected for `provider`.
    #[instrument(skip(self))]
    pub async fn cached(&self, provider: &str) -> Option<DetectedLimits> {
        let cached = self.detected.read().await.get(provider).copied();
        debug!(has_cached = cached.is_some(), "Retrieving cached rate limits");
        cached
    }

    /// Forget every detected limit.
    #[instrument(skip(self))]
    pub async fn clear_cache(&self) {
        debug!("Clearing cached rate limits");
        self.detected.write().await.clear();
    }
}

/// Parse a numeric header, ignoring malformed values.
fn parse_header_u64(headers: &HeaderMap, key: &str) -> Option<u64> {
    headers.get(key)?.to_str().ok()?.trim().parse().ok()
}
