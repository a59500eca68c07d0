//! Per-provider limiter registry with shared backoff.
//!
//! A [`ProviderLimiterRegistry`] owns, for every provider identifier, a request
//! bucket, a token bucket, an admission control, and the provider's backoff
//! state. Entries are created lazily on first use and live as long as the
//! registry. Construct one registry per process (or per test) and share it
//! behind an `Arc`.
//!
//! Limits are fixed the first time a provider is seen: later calls passing a
//! different [`RateLimitConfig`] get the existing entry and a warning.

use crate::queue::Reservation;
use crate::{
    LeakyBucket, QueueSettings, RateLimitConfig, RequestAdmissionControl, backoff_delay,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tollgate_error::{RateLimitError, RateLimitErrorKind};
use tracing::{debug, info, instrument, warn};

/// The limiter triple for one provider.
#[derive(Debug, derive_getters::Getters)]
pub struct ProviderLimiters {
    /// Limits requests per minute (after the safety margin).
    request_bucket: LeakyBucket,
    /// Limits tokens per minute (after the safety margin).
    token_bucket: LeakyBucket,
    /// Fair gate over both ceilings.
    admission: RequestAdmissionControl,
    /// Limits fixed at creation.
    config: RateLimitConfig,
}

impl ProviderLimiters {
    fn new(config: &RateLimitConfig, settings: QueueSettings) -> Self {
        let requests = config.safe_requests_per_minute();
        let tokens = config.safe_tokens_per_minute();
        Self {
            request_bucket: LeakyBucket::with_settings(requests, settings),
            token_bucket: LeakyBucket::with_settings(tokens, settings),
            admission: RequestAdmissionControl::with_settings(requests, tokens, settings),
            config: config.clone(),
        }
    }

    /// Admit, then take one request and `tokens` tokens.
    ///
    /// Either every stage is kept or none is: a later stage timing out, or
    /// the future being dropped, returns what the earlier stages reserved.
    async fn acquire(
        &self,
        tokens: u64,
        penalty: u32,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        let mut held = Held::new(self);
        held.admission = Some(self.admission.reserve(tokens, penalty, timeout).await?);
        held.request = self.request_bucket.reserve(1, timeout, penalty).await?;
        held.tokens = self.token_bucket.reserve(tokens, timeout, penalty).await?;
        held.commit();
        Ok(())
    }

    fn acquire_blocking(
        &self,
        tokens: u64,
        penalty: u32,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        let mut held = Held::new(self);
        held.admission = Some(self.admission.reserve_blocking(tokens, penalty, timeout)?);
        held.request = self.request_bucket.reserve_blocking(1, timeout, penalty)?;
        held.tokens = self.token_bucket.reserve_blocking(tokens, timeout, penalty)?;
        held.commit();
        Ok(())
    }
}

/// Reservations taken so far by one acquisition; released on drop unless committed.
struct Held<'a> {
    limiters: &'a ProviderLimiters,
    admission: Option<Reservation>,
    request: Option<Reservation>,
    tokens: Option<Reservation>,
}

impl<'a> Held<'a> {
    fn new(limiters: &'a ProviderLimiters) -> Self {
        Self {
            limiters,
            admission: None,
            request: None,
            tokens: None,
        }
    }

    fn commit(&mut self) {
        self.admission = None;
        self.request = None;
        self.tokens = None;
    }
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        if let Some(reservation) = self.tokens.take() {
            self.limiters.token_bucket.release(reservation);
        }
        if let Some(reservation) = self.request.take() {
            self.limiters.request_bucket.release(reservation);
        }
        if let Some(reservation) = self.admission.take() {
            debug!("Acquisition abandoned, returning admission");
            self.limiters.admission.release(reservation);
        }
    }
}

#[derive(Debug, Default)]
struct Backoff {
    until: Option<Instant>,
    consecutive_failures: u32,
}

#[derive(Debug)]
struct ProviderState {
    limiters: Arc<ProviderLimiters>,
    backoff: Mutex<Backoff>,
}

impl ProviderState {
    fn backoff_remaining(&self, now: Instant) -> Duration {
        self.backoff
            .lock()
            .until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn consecutive_failures(&self) -> u32 {
        self.backoff.lock().consecutive_failures
    }
}

/// Bookkeeping for one `acquire` call, shared by the async and blocking forms.
struct AcquireRun<'a> {
    provider: &'a str,
    config: &'a RateLimitConfig,
    state: &'a ProviderState,
    started: Instant,
    deadline: Option<Instant>,
    attempt: u32,
}

impl<'a> AcquireRun<'a> {
    fn new(
        provider: &'a str,
        config: &'a RateLimitConfig,
        state: &'a ProviderState,
        timeout: Option<Duration>,
    ) -> Self {
        let started = Instant::now();
        Self {
            provider,
            config,
            state,
            started,
            deadline: timeout.and_then(|timeout| started.checked_add(timeout)),
            attempt: 0,
        }
    }

    fn bounded(&self, wait: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => wait.min(deadline.saturating_duration_since(Instant::now())),
            None => wait,
        }
    }

    /// Time left in the provider's shared backoff window.
    fn backoff_wait(&self) -> Duration {
        let wait = self.state.backoff_remaining(Instant::now());
        if !wait.is_zero() {
            debug!(
                provider = self.provider,
                wait_ms = wait.as_millis() as u64,
                "Waiting out provider backoff"
            );
        }
        self.bounded(wait)
    }

    /// Penalty and capacity timeout for the next attempt.
    fn start_attempt(&self) -> Result<(u32, Duration), RateLimitError> {
        let now = Instant::now();
        let mut timeout = self.config.per_attempt_timeout();
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                return Err(RateLimitError::timeout(
                    self.provider,
                    now.duration_since(self.started),
                ));
            }
            timeout = timeout.min(remaining);
        }
        let penalty = self
            .state
            .consecutive_failures()
            .saturating_add(self.attempt);
        Ok((penalty, timeout))
    }

    /// Decide whether a failed attempt is retried, and after how long.
    fn on_error(&mut self, err: RateLimitError) -> Result<Duration, RateLimitError> {
        if !err.kind().is_retryable() {
            return Err(err);
        }
        self.attempt += 1;
        if self.attempt > *self.config.max_retries() {
            warn!(
                provider = self.provider,
                attempts = self.attempt,
                error = %err,
                "Capacity acquisition failed on every attempt"
            );
            return Err(err);
        }
        let failures = self.state.consecutive_failures();
        let delay = backoff_delay(self.config, failures.saturating_add(self.attempt - 1));
        warn!(
            provider = self.provider,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Capacity acquisition failed, backing off"
        );
        Ok(self.bounded(delay))
    }
}

/// Registry of per-provider limiters and backoff state.
///
/// # Example
///
/// ```
/// use tollgate_rate_limit::{ProviderLimiterRegistry, RateLimitConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = ProviderLimiterRegistry::new();
/// let config = RateLimitConfig::with_limits(100, 10_000);
/// registry.acquire("anthropic", &config, 250).await?;
/// let limiters = registry.get_limiters("anthropic", &config);
/// assert_eq!(*limiters.admission().usage().tokens(), 250);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ProviderLimiterRegistry {
    providers: RwLock<HashMap<String, Arc<ProviderState>>>,
    settings: QueueSettings,
}

impl ProviderLimiterRegistry {
    /// Create an empty registry with default queue settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose limiters use `settings`.
    pub fn with_settings(settings: QueueSettings) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Queue settings applied to newly created limiters.
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn state(&self, provider: &str, config: &RateLimitConfig) -> Arc<ProviderState> {
        if let Some(state) = self.providers.read().get(provider) {
            if state.limiters.config() != config {
                warn!(
                    provider,
                    fixed_rpm = state.limiters.config().requests_per_minute(),
                    fixed_tpm = state.limiters.config().tokens_per_minute(),
                    requested_rpm = config.requests_per_minute(),
                    requested_tpm = config.tokens_per_minute(),
                    "Provider limits already fixed; ignoring different config"
                );
            }
            return Arc::clone(state);
        }

        let mut providers = self.providers.write();
        let state = providers.entry(provider.to_string()).or_insert_with(|| {
            info!(
                provider,
                safe_rpm = config.safe_requests_per_minute(),
                safe_tpm = config.safe_tokens_per_minute(),
                "Creating provider limiters"
            );
            Arc::new(ProviderState {
                limiters: Arc::new(ProviderLimiters::new(config, self.settings)),
                backoff: Mutex::new(Backoff::default()),
            })
        });
        Arc::clone(state)
    }

    fn existing(&self, provider: &str) -> Option<Arc<ProviderState>> {
        self.providers.read().get(provider).cloned()
    }

    /// Limiters for `provider`, created from `config` on first use.
    pub fn get_limiters(&self, provider: &str, config: &RateLimitConfig) -> Arc<ProviderLimiters> {
        Arc::clone(&self.state(provider, config).limiters)
    }

    /// Provider identifiers seen so far.
    pub fn providers(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    /// Reserve one request and `tokens` tokens for `provider`.
    ///
    /// Waits out any shared backoff, then admits and drains both buckets,
    /// retrying with backoff up to `max_retries` times when capacity does not
    /// free up within the per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns the last capacity error once every attempt has failed.
    #[instrument(skip(self, config))]
    pub async fn acquire(
        &self,
        provider: &str,
        config: &RateLimitConfig,
        tokens: u64,
    ) -> Result<(), RateLimitError> {
        self.acquire_within(provider, config, tokens, None).await
    }

    /// Blocking form of [`acquire`](Self::acquire).
    ///
    /// # Errors
    ///
    /// Returns the last capacity error once every attempt has failed.
    #[instrument(skip(self, config))]
    pub fn acquire_blocking(
        &self,
        provider: &str,
        config: &RateLimitConfig,
        tokens: u64,
    ) -> Result<(), RateLimitError> {
        self.acquire_blocking_within(provider, config, tokens, None)
    }

    /// [`acquire`](Self::acquire) bounded by an overall timeout.
    pub(crate) async fn acquire_within(
        &self,
        provider: &str,
        config: &RateLimitConfig,
        tokens: u64,
        timeout: Option<Duration>,
    ) -> Result<(), RateLimitError> {
        if !config.enabled() {
            debug!(provider, "Rate limiting disabled");
            return Ok(());
        }
        let state = self.state(provider, config);
        let mut run = AcquireRun::new(provider, config, &state, timeout);
        loop {
            let wait = run.backoff_wait();
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            let (penalty, attempt_timeout) = run.start_attempt()?;
            match state.limiters.acquire(tokens, penalty, attempt_timeout).await {
                Ok(()) => {
                    debug!(provider, tokens, penalty, "Capacity acquired");
                    return Ok(());
                }
                Err(err) => {
                    let delay = run.on_error(err)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// [`acquire_blocking`](Self::acquire_blocking) bounded by an overall timeout.
    pub(crate) fn acquire_blocking_within(
        &self,
        provider: &str,
        config: &RateLimitConfig,
        tokens: u64,
        timeout: Option<Duration>,
    ) -> Result<(), RateLimitError> {
        if !config.enabled() {
            debug!(provider, "Rate limiting disabled");
            return Ok(());
        }
        let state = self.state(provider, config);
        let mut run = AcquireRun::new(provider, config, &state, timeout);
        loop {
            let wait = run.backoff_wait();
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            let (penalty, attempt_timeout) = run.start_attempt()?;
            match state
                .limiters
                .acquire_blocking(tokens, penalty, attempt_timeout)
            {
                Ok(()) => {
                    debug!(provider, tokens, penalty, "Capacity acquired");
                    return Ok(());
                }
                Err(err) => {
                    let delay = run.on_error(err)?;
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Register a rate-limit signal from `provider` and extend its backoff.
    ///
    /// Returns the delay this caller must wait.
    fn register_failure(
        &self,
        provider: &str,
        config: &RateLimitConfig,
        retry_after: Option<Duration>,
    ) -> Result<Duration, RateLimitError> {
        let state = self.state(provider, config);
        let mut backoff = state.backoff.lock();
        backoff.consecutive_failures = backoff.consecutive_failures.saturating_add(1);
        let failures = backoff.consecutive_failures;

        if failures > *config.max_retries() {
            warn!(
                provider,
                failures,
                max_retries = config.max_retries(),
                "Provider rate limited past retry budget"
            );
            return Err(RateLimitError::new(RateLimitErrorKind::RetriesExhausted {
                provider: provider.to_string(),
                failures,
                max_retries: *config.max_retries(),
            }));
        }

        let delay = backoff_delay(config, failures).max(retry_after.unwrap_or_default());
        let until = Instant::now() + delay;
        backoff.until = Some(backoff.until.map_or(until, |current| current.max(until)));
        warn!(
            provider,
            failures,
            delay_ms = delay.as_millis() as u64,
            "Provider rate limited, backing off"
        );
        Ok(delay)
    }

    /// Record a rate-limit signal from `provider` and wait out the backoff.
    ///
    /// Every other caller for `provider` also waits until the backoff window
    /// lapses before its next acquisition.
    ///
    /// # Errors
    ///
    /// Returns a retries-exhausted error once the provider has signalled more
    /// than `max_retries` times without an intervening success.
    #[instrument(skip(self, config))]
    pub async fn handle_failure(
        &self,
        provider: &str,
        config: &RateLimitConfig,
    ) -> Result<Duration, RateLimitError> {
        self.handle_failure_with_hint(provider, config, None).await
    }

    /// [`handle_failure`](Self::handle_failure) honouring a provider `Retry-After`.
    ///
    /// # Errors
    ///
    /// Returns a retries-exhausted error once the retry budget is spent.
    #[instrument(skip(self, config))]
    pub async fn handle_failure_with_hint(
        &self,
        provider: &str,
        config: &RateLimitConfig,
        retry_after: Option<Duration>,
    ) -> Result<Duration, RateLimitError> {
        let delay = self.register_failure(provider, config, retry_after)?;
        tokio::time::sleep(delay).await;
        Ok(delay)
    }

    /// Blocking form of [`handle_failure`](Self::handle_failure).
    ///
    /// # Errors
    ///
    /// Returns a retries-exhausted error once the retry budget is spent.
    #[instrument(skip(self, config))]
    pub fn handle_failure_blocking(
        &self,
        provider: &str,
        config: &RateLimitConfig,
    ) -> Result<Duration, RateLimitError> {
        self.handle_failure_with_hint_blocking(provider, config, None)
    }

    /// Blocking form of [`handle_failure_with_hint`](Self::handle_failure_with_hint).
    ///
    /// # Errors
    ///
    /// Returns a retries-exhausted error once the retry budget is spent.
    #[instrument(skip(self, config))]
    pub fn handle_failure_with_hint_blocking(
        &self,
        provider: &str,
        config: &RateLimitConfig,
        retry_after: Option<Duration>,
    ) -> Result<Duration, RateLimitError> {
        let delay = self.register_failure(provider, config, retry_after)?;
        std::thread::sleep(delay);
        Ok(delay)
    }

    /// Reset the failure count after a call that was admitted and completed.
    #[instrument(skip(self))]
    pub fn record_success(&self, provider: &str) {
        if let Some(state) = self.existing(provider) {
            let mut backoff = state.backoff.lock();
            if backoff.consecutive_failures > 0 {
                debug!(
                    provider,
                    cleared = backoff.consecutive_failures,
                    "Resetting consecutive failures"
                );
            }
            backoff.consecutive_failures = 0;
        }
    }

    /// Record tokens a completed call actually consumed.
    ///
    /// Providers without limiters yet have nothing to record against.
    ///
    /// # Errors
    ///
    /// Returns a limit-exceeded error when the usage does not fit the window.
    #[instrument(skip(self))]
    pub fn record_usage(
        &self,
        provider: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), RateLimitError> {
        match self.existing(provider) {
            Some(state) => state.limiters.admission.add_usage(input_tokens, output_tokens),
            None => {
                debug!(provider, "No limiters for provider, usage not recorded");
                Ok(())
            }
        }
    }

    /// End of the shared backoff window for `provider`, if one was set.
    pub fn backoff_until(&self, provider: &str) -> Option<Instant> {
        self.existing(provider)
            .and_then(|state| state.backoff.lock().until)
    }

    /// Rate-limit signals since the last success for `provider`.
    pub fn consecutive_failures(&self, provider: &str) -> u32 {
        self.existing(provider)
            .map(|state| state.consecutive_failures())
            .unwrap_or(0)
    }
}
