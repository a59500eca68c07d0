//! Dual-ceiling admission control with fair queuing.

use crate::queue::{FairQueue, Ledger, QueueItem, QueueSettings, Reservation};
use crate::window::RollingWindow;
use std::time::{Duration, Instant};
use tollgate_core::TokenUsage;
use tollgate_error::RateLimitError;
use tracing::{debug, instrument, warn};

/// Request and token windows checked together.
struct AdmissionLedger {
    max_requests: u64,
    max_tokens: u64,
    requests: RollingWindow<u64>,
    tokens: RollingWindow<TokenUsage>,
}

impl AdmissionLedger {
    fn tokens_fit(&self, tokens: u64) -> bool {
        self.max_tokens == 0 || self.tokens.total().saturating_add(tokens) <= self.max_tokens
    }

    fn requests_fit(&self) -> bool {
        self.max_requests == 0 || self.requests.total() < self.max_requests
    }
}

impl Ledger for AdmissionLedger {
    fn prune(&mut self, now: Instant) {
        self.requests.prune(now);
        self.tokens.prune(now);
    }

    fn fits(&self, cost: u64) -> bool {
        self.requests_fit() && self.tokens_fit(cost)
    }

    fn record(&mut self, cost: u64, now: Instant) {
        self.requests.push(now, 1);
        if cost > 0 {
            self.tokens.push(now, TokenUsage::reserved(cost));
        }
    }

    fn release(&mut self, cost: u64, recorded_at: Instant) {
        self.requests.release(recorded_at, 1);
        if cost > 0 {
            self.tokens.release(recorded_at, cost);
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        match (self.requests.next_expiry(), self.tokens.next_expiry()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-window load of a [`RequestAdmissionControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, derive_getters::Getters)]
pub struct WindowUsage {
    /// Requests admitted within the window.
    requests: u64,
    /// Tokens reserved or recorded within the window.
    tokens: u64,
}

/// Gate combining a request ceiling and a token ceiling over a rolling window.
///
/// Waiting callers are admitted in `(penalty, arrival)` order. A caller at
/// the head of the queue that does not fit is re-queued with its penalty
/// raised by one, letting smaller requests through around it.
///
/// A ceiling of `0` disables that dimension.
///
/// # Example
///
/// ```
/// use tollgate_rate_limit::RequestAdmissionControl;
///
/// let control = RequestAdmissionControl::new(10, 1_000);
/// assert!(control.can_admit(900));
/// assert!(!control.can_admit(1_001));
/// ```
pub struct RequestAdmissionControl {
    max_requests: u64,
    max_tokens: u64,
    queue: FairQueue<AdmissionLedger>,
}

impl std::fmt::Debug for RequestAdmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAdmissionControl")
            .field("max_requests", &self.max_requests)
            .field("max_tokens", &self.max_tokens)
            .field("usage", &self.usage())
            .field("queued", &self.queued())
            .finish()
    }
}

impl RequestAdmissionControl {
    /// Create a control with the default 60 second window.
    pub fn new(max_requests: u64, max_tokens: u64) -> Self {
        Self::with_settings(max_requests, max_tokens, QueueSettings::default())
    }

    /// Create a control with a custom window.
    pub fn with_window(max_requests: u64, max_tokens: u64, window: Duration) -> Self {
        Self::with_settings(
            max_requests,
            max_tokens,
            QueueSettings::default().with_window(window),
        )
    }

    /// Create a control with explicit queue settings.
    pub fn with_settings(max_requests: u64, max_tokens: u64, settings: QueueSettings) -> Self {
        debug!(max_requests, max_tokens, "Creating admission control");
        let ledger = AdmissionLedger {
            max_requests,
            max_tokens,
            requests: RollingWindow::new(*settings.window()),
            tokens: RollingWindow::new(*settings.window()),
        };
        Self {
            max_requests,
            max_tokens,
            queue: FairQueue::new("admission", ledger, settings),
        }
    }

    /// Request ceiling.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Token ceiling.
    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// Queue settings in effect.
    pub fn settings(&self) -> &QueueSettings {
        self.queue.settings()
    }

    /// Whether one more request costing `tokens` fits under both ceilings now.
    ///
    /// Does not reserve anything and ignores callers already queued.
    pub fn can_admit(&self, tokens: u64) -> bool {
        self.queue.with_ledger(|ledger| ledger.fits(tokens))
    }

    /// Reserve one request slot and `tokens` tokens, suspending until both fit.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when `timeout` elapses first; the caller's
    /// queue entry is withdrawn and nothing is reserved.
    #[instrument(skip(self), fields(max_requests = self.max_requests, max_tokens = self.max_tokens))]
    pub async fn admit(
        &self,
        tokens: u64,
        penalty: u32,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        self.reserve(tokens, penalty, timeout).await.map(|_| ())
    }

    /// Blocking form of [`admit`](Self::admit).
    ///
    /// # Errors
    ///
    /// Returns a timeout error when `timeout` elapses first.
    #[instrument(skip(self), fields(max_requests = self.max_requests, max_tokens = self.max_tokens))]
    pub fn admit_blocking(
        &self,
        tokens: u64,
        penalty: u32,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        self.reserve_blocking(tokens, penalty, timeout).map(|_| ())
    }

    pub(crate) async fn reserve(
        &self,
        tokens: u64,
        penalty: u32,
        timeout: Duration,
    ) -> Result<Reservation, RateLimitError> {
        self.queue.acquire(tokens, penalty, timeout).await
    }

    pub(crate) fn reserve_blocking(
        &self,
        tokens: u64,
        penalty: u32,
        timeout: Duration,
    ) -> Result<Reservation, RateLimitError> {
        self.queue.acquire_blocking(tokens, penalty, timeout)
    }

    /// Withdraw an admission whose request never went out.
    pub(crate) fn release(&self, reservation: Reservation) {
        self.queue.release(reservation);
    }

    /// Record tokens actually consumed after a call completed.
    ///
    /// # Errors
    ///
    /// Returns a limit-exceeded error, without recording, when the usage
    /// would push the window past the token ceiling.
    #[instrument(skip(self))]
    pub fn add_usage(&self, input_tokens: u64, output_tokens: u64) -> Result<(), RateLimitError> {
        let usage = TokenUsage::new(input_tokens, output_tokens);
        let max_tokens = self.max_tokens;
        self.queue.with_ledger(|ledger| {
            if !ledger.tokens_fit(*usage.total_tokens()) {
                warn!(
                    in_window = ledger.tokens.total(),
                    adding = *usage.total_tokens(),
                    max_tokens,
                    "Recorded usage would exceed token ceiling"
                );
                return Err(RateLimitError::limit_exceeded(format!(
                    "recording {} tokens would exceed {} tokens per window ({} in use)",
                    usage.total_tokens(),
                    max_tokens,
                    ledger.tokens.total()
                )));
            }
            ledger.tokens.push(Instant::now(), usage);
            Ok(())
        })
    }

    /// Current in-window load.
    pub fn usage(&self) -> WindowUsage {
        self.queue.with_ledger(|ledger| WindowUsage {
            requests: ledger.requests.total(),
            tokens: ledger.tokens.total(),
        })
    }

    /// Callers currently waiting.
    pub fn queued(&self) -> usize {
        self.queue.queued()
    }

    /// Waiting callers in the order they will be considered.
    pub fn waiting(&self) -> Vec<QueueItem> {
        self.queue.waiting()
    }
}
