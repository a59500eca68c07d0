//! Provider-bound gate and retry wrapper.
//!
//! [`ProviderGate`] is what a provider client holds: it binds a shared
//! [`ProviderLimiterRegistry`] to one provider identifier and its limits, and
//! wraps calls with cost estimation, capacity acquisition, and
//! classification-driven retry.

use crate::{BackoffSchedule, HeaderRateLimitDetector, ProviderLimiterRegistry, RateLimitConfig};
use reqwest::header::HeaderMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry2::{Retry, RetryError};
use tollgate_core::{Message, ReportsUsage, TokenEstimator};
use tollgate_error::{Classify, ProviderError, ProviderErrorKind, RateLimitError};
use tracing::{debug, instrument, warn};

/// Capacity gate for one provider.
///
/// Cheap to clone; clones share the registry.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tollgate_core::{Message, Role, TokenUsage};
/// use tollgate_error::HttpError;
/// use tollgate_rate_limit::{ProviderGate, ProviderLimiterRegistry, RateLimitConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Arc::new(ProviderLimiterRegistry::new());
/// let gate = ProviderGate::new(registry, "openai", RateLimitConfig::with_limits(500, 200_000));
///
/// let messages = vec![Message::text(Role::User, "Summarise this document")];
/// let usage = gate
///     .call(&messages, || async { Ok::<_, HttpError>(TokenUsage::new(6, 40)) })
///     .await?;
/// assert_eq!(*usage.output_tokens(), 40);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, derive_getters::Getters)]
pub struct ProviderGate {
    /// Registry shared with every other gate in the process
    registry: Arc<ProviderLimiterRegistry>,
    /// Provider identifier
    provider: String,
    /// Limits and retry policy
    config: RateLimitConfig,
    /// Input cost estimation
    estimator: TokenEstimator,
}

impl ProviderGate {
    /// Gate for `provider` counting text with the `cl100k_base` tokenizer.
    ///
    /// If the tokenizer cannot be loaded, text is estimated at four
    /// characters per token instead.
    pub fn new(
        registry: Arc<ProviderLimiterRegistry>,
        provider: impl Into<String>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            registry,
            provider: provider.into(),
            config,
            estimator: TokenEstimator::tokenizer_or_characters(),
        }
    }

    /// Replace the cost estimator.
    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Estimated input tokens for `messages`.
    pub fn estimate(&self, messages: &[Message]) -> u64 {
        self.estimator.estimate_messages(messages)
    }

    /// Reserve capacity for a request costing `estimated_tokens`.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when capacity is not available within
    /// `timeout`, including time spent waiting out a provider backoff.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn acquire_capacity(
        &self,
        estimated_tokens: u64,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        self.registry
            .acquire_within(&self.provider, &self.config, estimated_tokens, Some(timeout))
            .await
    }

    /// Blocking form of [`acquire_capacity`](Self::acquire_capacity).
    ///
    /// # Errors
    ///
    /// Returns a timeout error when capacity is not available within `timeout`.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub fn acquire_capacity_blocking(
        &self,
        estimated_tokens: u64,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        self.registry.acquire_blocking_within(
            &self.provider,
            &self.config,
            estimated_tokens,
            Some(timeout),
        )
    }

    /// Record tokens a completed call actually consumed.
    ///
    /// This is the post-execution callback: the call went through, so the
    /// provider's consecutive failure count is reset as well, even when the
    /// usage itself is rejected.
    ///
    /// # Errors
    ///
    /// Returns a limit-exceeded error when the usage does not fit the window.
    pub fn record_usage(
        &self,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), RateLimitError> {
        let recorded = self
            .registry
            .record_usage(&self.provider, input_tokens, output_tokens);
        self.record_success();
        recorded
    }

    /// Signal that a call completed without being throttled.
    pub fn record_success(&self) {
        self.registry.record_success(&self.provider);
    }

    /// Report a throttling response and wait out the provider-wide backoff.
    ///
    /// # Errors
    ///
    /// Returns a retries-exhausted error once the retry budget is spent.
    pub async fn notify_rate_limited(&self) -> Result<Duration, RateLimitError> {
        self.registry
            .handle_failure(&self.provider, &self.config)
            .await
    }

    /// [`notify_rate_limited`](Self::notify_rate_limited) honouring the
    /// response's `Retry-After` header.
    ///
    /// # Errors
    ///
    /// Returns a retries-exhausted error once the retry budget is spent.
    pub async fn notify_rate_limited_from_headers(
        &self,
        headers: &HeaderMap,
    ) -> Result<Duration, RateLimitError> {
        let retry_after = HeaderRateLimitDetector::retry_after(headers);
        self.registry
            .handle_failure_with_hint(&self.provider, &self.config, retry_after)
            .await
    }

    /// Blocking form of [`notify_rate_limited`](Self::notify_rate_limited).
    ///
    /// # Errors
    ///
    /// Returns a retries-exhausted error once the retry budget is spent.
    pub fn notify_rate_limited_blocking(&self) -> Result<Duration, RateLimitError> {
        self.registry
            .handle_failure_blocking(&self.provider, &self.config)
    }

    /// Run `operation` under the limiter, retrying retriable failures.
    ///
    /// Each attempt acquires capacity for the estimated input tokens, then
    /// invokes `operation`. Failures are classified: authentication and
    /// invalid-request failures return at once; rate-limit failures also
    /// extend the provider-wide backoff; everything else is retried after a
    /// jittered delay, up to `max_retries` times. On success the reported
    /// output tokens are recorded and the provider's failure count resets.
    ///
    /// # Errors
    ///
    /// Returns the classified last failure.
    #[instrument(skip_all, fields(provider = %self.provider))]
    pub async fn call<T, E, F, Fut>(
        &self,
        messages: &[Message],
        mut operation: F,
    ) -> Result<T, ProviderError>
    where
        T: ReportsUsage,
        E: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let tokens = self.estimate(messages);
        let mut attempt = 0u32;

        Retry::spawn(BackoffSchedule::new(&self.config), || {
            attempt += 1;
            let invocation = operation();
            let gate = self;
            let attempt = attempt;
            async move {
                debug!(attempt, tokens, "Starting provider call");
                if let Err(err) = gate
                    .registry
                    .acquire(&gate.provider, &gate.config, tokens)
                    .await
                {
                    return Err(gate.retry_decision(ProviderError::from(err)));
                }
                match invocation.await {
                    Ok(value) => {
                        gate.finish(&value);
                        Ok(value)
                    }
                    Err(err) => {
                        let err = ProviderError::from_failure(&err);
                        if err.kind() == ProviderErrorKind::RateLimit {
                            let backoff = gate
                                .registry
                                .handle_failure(&gate.provider, &gate.config)
                                .await;
                            if let Err(exhausted) = backoff {
                                warn!(error = %exhausted, "Giving up on rate limited provider");
                                return Err(RetryError::Permanent(err));
                            }
                        }
                        Err(gate.retry_decision(err))
                    }
                }
            }
        })
        .await
    }

    /// Blocking form of [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// Returns the classified last failure.
    #[instrument(skip_all, fields(provider = %self.provider))]
    pub fn call_blocking<T, E, F>(
        &self,
        messages: &[Message],
        mut operation: F,
    ) -> Result<T, ProviderError>
    where
        T: ReportsUsage,
        E: Classify,
        F: FnMut() -> Result<T, E>,
    {
        let tokens = self.estimate(messages);
        let mut delays = BackoffSchedule::new(&self.config);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(attempt, tokens, "Starting provider call");
            let failure = match self
                .registry
                .acquire_blocking(&self.provider, &self.config, tokens)
            {
                Err(err) => self.retry_decision(ProviderError::from(err)),
                Ok(()) => match operation() {
                    Ok(value) => {
                        self.finish(&value);
                        return Ok(value);
                    }
                    Err(err) => self.classify_failure_blocking(&err),
                },
            };

            match failure {
                RetryError::Permanent(err) => return Err(err),
                RetryError::Transient { err, .. } => match delays.next() {
                    Some(delay) => std::thread::sleep(delay),
                    None => {
                        warn!(attempts = attempt, error = %err, "Retries exhausted");
                        return Err(err);
                    }
                },
            }
        }
    }

    fn classify_failure_blocking<E: Classify>(&self, err: &E) -> RetryError<ProviderError> {
        let err = ProviderError::from_failure(err);
        if err.kind() == ProviderErrorKind::RateLimit {
            let backoff = self
                .registry
                .handle_failure_blocking(&self.provider, &self.config);
            if let Err(exhausted) = backoff {
                warn!(error = %exhausted, "Giving up on rate limited provider");
                return RetryError::Permanent(err);
            }
        }
        self.retry_decision(err)
    }

    fn retry_decision(&self, err: ProviderError) -> RetryError<ProviderError> {
        if err.is_retryable() {
            warn!(kind = %err.kind(), error = %err, "Provider call failed, will retry");
            RetryError::Transient {
                err,
                retry_after: None,
            }
        } else {
            warn!(
                kind = %err.kind(),
                error = %err,
                "Permanent provider error, failing immediately"
            );
            RetryError::Permanent(err)
        }
    }

    fn finish<T: ReportsUsage>(&self, value: &T) {
        if let Some(usage) = value.token_usage() {
            let recorded = self
                .registry
                .record_usage(&self.provider, 0, *usage.output_tokens());
            if let Err(err) = recorded {
                warn!(error = %err, "Failed to record output tokens");
            }
        }
        self.registry.record_success(&self.provider);
    }
}
