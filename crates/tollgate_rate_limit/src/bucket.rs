//! Per-minute rate limiter for a single resource dimension.

use crate::queue::{FairQueue, Ledger, QueueSettings, Reservation};
use crate::window::RollingWindow;
use std::time::{Duration, Instant};
use tollgate_error::RateLimitError;
use tracing::{debug, instrument};

/// Units reserved over the trailing window, capped at `limit`.
struct BucketLedger {
    limit: u64,
    window: RollingWindow<u64>,
}

impl Ledger for BucketLedger {
    fn prune(&mut self, now: Instant) {
        self.window.prune(now);
    }

    fn fits(&self, cost: u64) -> bool {
        self.limit == 0 || self.window.total().saturating_add(cost) <= self.limit
    }

    fn record(&mut self, cost: u64, now: Instant) {
        self.window.push(now, cost);
    }

    fn release(&mut self, cost: u64, recorded_at: Instant) {
        self.window.release(recorded_at, cost);
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.window.next_expiry()
    }
}

/// Bounds one quantity (requests or tokens) to a rate per minute.
///
/// Capacity is the configured rate minus everything reserved during the
/// trailing window; reservations age out continuously. A reservation is
/// all-or-nothing. Waiting callers are served through the same fair queue as
/// [`RequestAdmissionControl`](crate::RequestAdmissionControl).
///
/// A single reservation larger than the whole rate can never be granted and
/// ends in a timeout. A rate of `0` disables the limit.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tollgate_rate_limit::LeakyBucket;
///
/// let bucket = LeakyBucket::new(2);
/// assert!(bucket.try_acquire(1));
/// assert!(bucket.try_acquire(1));
/// assert!(!bucket.try_acquire(1));
/// assert!(bucket.acquire_blocking(1, Duration::from_millis(20), 0).is_err());
/// ```
pub struct LeakyBucket {
    rate_per_minute: u64,
    queue: FairQueue<BucketLedger>,
}

impl std::fmt::Debug for LeakyBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("rate_per_minute", &self.rate_per_minute)
            .field("used", &self.used())
            .field("queued", &self.queued())
            .finish()
    }
}

impl LeakyBucket {
    /// Create a bucket with the default 60 second window.
    pub fn new(rate_per_minute: u64) -> Self {
        Self::with_settings(rate_per_minute, QueueSettings::default())
    }

    /// Create a bucket with a custom window.
    pub fn with_window(rate_per_minute: u64, window: Duration) -> Self {
        Self::with_settings(rate_per_minute, QueueSettings::default().with_window(window))
    }

    /// Create a bucket with explicit queue settings.
    pub fn with_settings(rate_per_minute: u64, settings: QueueSettings) -> Self {
        debug!(
            rate_per_minute,
            window_ms = settings.window().as_millis() as u64,
            "Creating leaky bucket"
        );
        let ledger = BucketLedger {
            limit: rate_per_minute,
            window: RollingWindow::new(*settings.window()),
        };
        Self {
            rate_per_minute,
            queue: FairQueue::new("leaky bucket", ledger, settings),
        }
    }

    /// Configured rate.
    pub fn rate_per_minute(&self) -> u64 {
        self.rate_per_minute
    }

    /// Queue settings in effect.
    pub fn settings(&self) -> &QueueSettings {
        self.queue.settings()
    }

    /// Units reserved within the current window.
    pub fn used(&self) -> u64 {
        self.queue.with_ledger(|ledger| ledger.window.total())
    }

    /// Units that could be reserved right now (`u64::MAX` when unlimited).
    pub fn available(&self) -> u64 {
        if self.rate_per_minute == 0 {
            return u64::MAX;
        }
        self.rate_per_minute.saturating_sub(self.used())
    }

    /// Callers currently waiting.
    pub fn queued(&self) -> usize {
        self.queue.queued()
    }

    /// Reserve `amount` units only if that is possible without waiting.
    pub fn try_acquire(&self, amount: u64) -> bool {
        amount == 0 || self.queue.try_admit(amount).is_some()
    }

    /// Reserve `amount` units, suspending until capacity frees up.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when `timeout` elapses first.
    #[instrument(skip(self), fields(rate_per_minute = self.rate_per_minute))]
    pub async fn acquire(
        &self,
        amount: u64,
        timeout: Duration,
        penalty: u32,
    ) -> Result<(), RateLimitError> {
        self.reserve(amount, timeout, penalty).await.map(|_| ())
    }

    /// Reserve `amount` units, blocking the thread until capacity frees up.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when `timeout` elapses first.
    #[instrument(skip(self), fields(rate_per_minute = self.rate_per_minute))]
    pub fn acquire_blocking(
        &self,
        amount: u64,
        timeout: Duration,
        penalty: u32,
    ) -> Result<(), RateLimitError> {
        self.reserve_blocking(amount, timeout, penalty).map(|_| ())
    }

    /// [`acquire`](Self::acquire) returning a handle for [`release`](Self::release).
    ///
    /// `None` for a zero amount, which reserves nothing.
    pub(crate) async fn reserve(
        &self,
        amount: u64,
        timeout: Duration,
        penalty: u32,
    ) -> Result<Option<Reservation>, RateLimitError> {
        if amount == 0 {
            return Ok(None);
        }
        self.queue.acquire(amount, penalty, timeout).await.map(Some)
    }

    pub(crate) fn reserve_blocking(
        &self,
        amount: u64,
        timeout: Duration,
        penalty: u32,
    ) -> Result<Option<Reservation>, RateLimitError> {
        if amount == 0 {
            return Ok(None);
        }
        self.queue
            .acquire_blocking(amount, penalty, timeout)
            .map(Some)
    }

    /// Return units of a reservation that went unused.
    pub(crate) fn release(&self, reservation: Reservation) {
        self.queue.release(reservation);
    }
}
