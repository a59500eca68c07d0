//! Fair admission queue.
//!
//! Both [`LeakyBucket`](crate::LeakyBucket) and
//! [`RequestAdmissionControl`](crate::RequestAdmissionControl) serialize
//! waiting callers through this queue. Callers are served in
//! `(penalty, enqueue time)` order. When the head of the queue does not fit
//! the available capacity it is re-queued with its penalty raised by one,
//! once per requeue interval, so callers that keep failing to fit line up
//! behind fresher arrivals.
//!
//! There is no background dispatcher: every waiter runs a dispatch pass
//! under the queue lock each time it wakes, so the ordering is identical for
//! blocking callers (parked on a [`Condvar`]) and async callers (suspended on
//! a [`Notify`]). The lock is never held across a suspension point.

use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tollgate_error::RateLimitError;
use tracing::{debug, trace};

/// Trailing window over which usage counts against a limit.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Delay before a head-of-line caller that does not fit is re-queued.
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_millis(100);

/// Timing and fairness settings for a queue.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tollgate_rate_limit::QueueSettings;
///
/// let settings = QueueSettings::default()
///     .with_window(Duration::from_secs(10))
///     .with_max_penalty(20);
/// assert_eq!(*settings.window(), Duration::from_secs(10));
/// assert_eq!(*settings.max_penalty(), Some(20));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_getters::Getters)]
pub struct QueueSettings {
    /// Length of the rolling window.
    window: Duration,
    /// Pause between requeues of a head that does not fit.
    requeue_interval: Duration,
    /// Ceiling on the penalty a re-queued caller can accumulate (`None` = uncapped).
    max_penalty: Option<u32>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            max_penalty: None,
        }
    }
}

impl QueueSettings {
    /// Set the rolling window length.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the requeue interval.
    pub fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    /// Cap the penalty a caller can accumulate through requeues.
    pub fn with_max_penalty(mut self, max_penalty: u32) -> Self {
        self.max_penalty = Some(max_penalty);
        self
    }
}

/// A caller waiting for capacity.
///
/// Lower `penalty` goes first; equal penalties are served in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    penalty: u32,
    cost: u64,
    enqueued_at: Instant,
    seq: u64,
}

impl QueueItem {
    /// Times this caller has been pushed back (plus its starting penalty).
    pub fn penalty(&self) -> u32 {
        self.penalty
    }

    /// Units requested.
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// When the caller first joined the queue.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    fn penalize(&mut self, max_penalty: Option<u32>) {
        let raised = self.penalty.saturating_add(1);
        self.penalty = match max_penalty {
            Some(cap) => raised.min(cap.max(self.penalty)),
            None => raised,
        };
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.penalty
            .cmp(&other.penalty)
            .then(self.enqueued_at.cmp(&other.enqueued_at))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Capacity bookkeeping behind a queue.
pub(crate) trait Ledger: Send {
    /// Forget usage that has left the window.
    fn prune(&mut self, now: Instant);
    /// Whether `cost` more units can be recorded without exceeding a ceiling.
    fn fits(&self, cost: u64) -> bool;
    /// Record an admission of `cost` units.
    fn record(&mut self, cost: u64, now: Instant);
    /// Undo an admission recorded at `recorded_at`. No-op once it aged out.
    fn release(&mut self, cost: u64, recorded_at: Instant);
    /// Earliest moment some recorded usage leaves the window.
    fn next_expiry(&self) -> Option<Instant>;
}

/// Capacity recorded for one admitted caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    cost: u64,
    at: Instant,
}

struct QueueState<L> {
    ledger: L,
    waiting: BinaryHeap<Reverse<QueueItem>>,
    /// Admitted by another waiter's dispatch, not yet observed by the owner.
    admitted: HashMap<u64, Reservation>,
    next_seq: u64,
    requeue_at: Option<Instant>,
}

impl<L> QueueState<L> {
    /// Forget `seq`, returning its reservation if it had been admitted.
    fn remove(&mut self, seq: u64) -> Option<Reservation> {
        self.waiting.retain(|Reverse(item)| item.seq != seq);
        self.admitted.remove(&seq)
    }
}

enum Poll {
    Admitted(Reservation),
    Pending(Instant),
}

pub(crate) struct FairQueue<L> {
    resource: &'static str,
    settings: QueueSettings,
    state: Mutex<QueueState<L>>,
    condvar: Condvar,
    notify: Notify,
}

impl<L: Ledger> FairQueue<L> {
    pub(crate) fn new(resource: &'static str, ledger: L, settings: QueueSettings) -> Self {
        Self {
            resource,
            settings,
            state: Mutex::new(QueueState {
                ledger,
                waiting: BinaryHeap::new(),
                admitted: HashMap::new(),
                next_seq: 0,
                requeue_at: None,
            }),
            condvar: Condvar::new(),
            notify: Notify::new(),
        }
    }

    pub(crate) fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Run `f` against the pruned ledger.
    pub(crate) fn with_ledger<R>(&self, f: impl FnOnce(&mut L) -> R) -> R {
        let mut state = self.state.lock();
        state.ledger.prune(Instant::now());
        f(&mut state.ledger)
    }

    pub(crate) fn queued(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Waiting callers in service order.
    pub(crate) fn waiting(&self) -> Vec<QueueItem> {
        let state = self.state.lock();
        let mut items: Vec<QueueItem> = state
            .waiting
            .iter()
            .map(|Reverse(item)| item.clone())
            .collect();
        items.sort();
        items
    }

    /// Admit without waiting when nobody is queued and the ledger has room.
    pub(crate) fn try_admit(&self, cost: u64) -> Option<Reservation> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.ledger.prune(now);
        if state.waiting.is_empty() && state.ledger.fits(cost) {
            state.ledger.record(cost, now);
            Some(Reservation { cost, at: now })
        } else {
            None
        }
    }

    /// Give back capacity taken by an admission that was not used.
    pub(crate) fn release(&self, reservation: Reservation) {
        let mut state = self.state.lock();
        state.ledger.release(reservation.cost, reservation.at);
        trace!(resource = self.resource, cost = reservation.cost, "Released");
        self.wake_all();
    }

    /// Wait on the calling thread until `cost` units are admitted.
    pub(crate) fn acquire_blocking(
        &self,
        cost: u64,
        penalty: u32,
        timeout: Duration,
    ) -> Result<Reservation, RateLimitError> {
        if let Some(reservation) = self.try_admit(cost) {
            return Ok(reservation);
        }

        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let mut ticket = Ticket::new(self, self.enqueue(cost, penalty, started));

        let mut state = self.state.lock();
        loop {
            match self.poll(&mut state, ticket.seq, deadline, started) {
                Ok(Poll::Admitted(reservation)) => {
                    ticket.settle();
                    return Ok(reservation);
                }
                Ok(Poll::Pending(wake_at)) => {
                    self.condvar.wait_until(&mut state, wake_at);
                }
                Err(err) => {
                    ticket.settle();
                    return Err(err);
                }
            }
        }
    }

    /// Suspend the calling task until `cost` units are admitted.
    ///
    /// Dropping the future withdraws the caller from the queue.
    pub(crate) async fn acquire(
        &self,
        cost: u64,
        penalty: u32,
        timeout: Duration,
    ) -> Result<Reservation, RateLimitError> {
        if let Some(reservation) = self.try_admit(cost) {
            return Ok(reservation);
        }

        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let mut ticket = Ticket::new(self, self.enqueue(cost, penalty, started));

        loop {
            // Register for wakeups before inspecting state so a dispatch
            // between the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.state.lock();
                self.poll(&mut state, ticket.seq, deadline, started)
            };

            match step {
                Ok(Poll::Admitted(reservation)) => {
                    ticket.settle();
                    return Ok(reservation);
                }
                Ok(Poll::Pending(wake_at)) => {
                    let wake_at = tokio::time::Instant::from_std(wake_at);
                    let _ = tokio::time::timeout_at(wake_at, notified).await;
                }
                Err(err) => {
                    ticket.settle();
                    return Err(err);
                }
            }
        }
    }

    fn enqueue(&self, cost: u64, penalty: u32, now: Instant) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.waiting.push(Reverse(QueueItem {
            penalty,
            cost,
            enqueued_at: now,
            seq,
        }));
        trace!(resource = self.resource, seq, cost, penalty, "Enqueued");
        seq
    }

    fn cancel(&self, seq: u64) {
        let mut state = self.state.lock();
        if let Some(reservation) = state.remove(seq) {
            state.ledger.release(reservation.cost, reservation.at);
            debug!(
                resource = self.resource,
                seq,
                cost = reservation.cost,
                "Admitted caller went away, capacity returned"
            );
        }
        self.wake_all();
    }

    fn poll(
        &self,
        state: &mut QueueState<L>,
        seq: u64,
        deadline: Instant,
        started: Instant,
    ) -> Result<Poll, RateLimitError> {
        let now = Instant::now();
        if self.dispatch(state, now) {
            self.wake_all();
        }

        if let Some(reservation) = state.admitted.remove(&seq) {
            return Ok(Poll::Admitted(reservation));
        }

        if now >= deadline {
            state.waiting.retain(|Reverse(item)| item.seq != seq);
            self.wake_all();
            debug!(
                resource = self.resource,
                seq,
                waited_ms = now.duration_since(started).as_millis() as u64,
                "Timed out waiting for capacity"
            );
            return Err(RateLimitError::timeout(
                self.resource,
                now.duration_since(started),
            ));
        }

        let mut wake_at = deadline.min(now + self.settings.requeue_interval);
        if let Some(expiry) = state.ledger.next_expiry() {
            wake_at = wake_at.min(expiry);
        }
        Ok(Poll::Pending(wake_at))
    }

    /// Admit waiting callers in order until the head does not fit.
    ///
    /// A head that does not fit is re-queued with a higher penalty once the
    /// requeue interval has passed. Returns true when the queue changed.
    fn dispatch(&self, state: &mut QueueState<L>, now: Instant) -> bool {
        state.ledger.prune(now);

        let mut changed = false;
        while let Some(Reverse(mut head)) = state.waiting.pop() {
            if state.ledger.fits(head.cost) {
                state.ledger.record(head.cost, now);
                state.admitted.insert(
                    head.seq,
                    Reservation {
                        cost: head.cost,
                        at: now,
                    },
                );
                state.requeue_at = None;
                changed = true;
                debug!(
                    resource = self.resource,
                    seq = head.seq,
                    cost = head.cost,
                    penalty = head.penalty,
                    "Admitted"
                );
                continue;
            }

            match state.requeue_at {
                Some(at) if now >= at => {
                    head.penalize(self.settings.max_penalty);
                    debug!(
                        resource = self.resource,
                        seq = head.seq,
                        cost = head.cost,
                        penalty = head.penalty,
                        "Insufficient capacity, re-queued with penalty"
                    );
                    state.waiting.push(Reverse(head));
                    state.requeue_at = Some(now + self.settings.requeue_interval);
                    changed = true;
                }
                Some(_) => {
                    state.waiting.push(Reverse(head));
                    break;
                }
                None => {
                    state.waiting.push(Reverse(head));
                    state.requeue_at = Some(now + self.settings.requeue_interval);
                    break;
                }
            }
        }

        if state.waiting.is_empty() {
            state.requeue_at = None;
        }
        changed
    }

    fn wake_all(&self) {
        self.condvar.notify_all();
        self.notify.notify_waiters();
    }
}

/// Withdraws a queued caller unless settled first.
struct Ticket<'a, L: Ledger> {
    queue: &'a FairQueue<L>,
    seq: u64,
    settled: bool,
}

impl<'a, L: Ledger> Ticket<'a, L> {
    fn new(queue: &'a FairQueue<L>, seq: u64) -> Self {
        Self {
            queue,
            seq,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl<L: Ledger> Drop for Ticket<'_, L> {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.cancel(self.seq);
        }
    }
}

fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + Duration::from_secs(60 * 60 * 24 * 365))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts units with no expiry.
    struct Counter {
        used: u64,
        capacity: u64,
    }

    impl Ledger for Counter {
        fn prune(&mut self, _now: Instant) {}

        fn fits(&self, cost: u64) -> bool {
            self.used + cost <= self.capacity
        }

        fn record(&mut self, cost: u64, _now: Instant) {
            self.used += cost;
        }

        fn release(&mut self, cost: u64, _recorded_at: Instant) {
            self.used -= cost;
        }

        fn next_expiry(&self) -> Option<Instant> {
            None
        }
    }

    fn queue(capacity: u64) -> FairQueue<Counter> {
        FairQueue::new(
            "test",
            Counter { used: 0, capacity },
            QueueSettings::default().with_requeue_interval(Duration::from_millis(10)),
        )
    }

    #[test]
    fn test_items_order_by_penalty_then_arrival() {
        let now = Instant::now();
        let early = QueueItem { penalty: 1, cost: 1, enqueued_at: now, seq: 0 };
        let late = QueueItem {
            penalty: 0,
            cost: 1,
            enqueued_at: now + Duration::from_millis(5),
            seq: 1,
        };
        let later = QueueItem {
            penalty: 0,
            cost: 1,
            enqueued_at: now + Duration::from_millis(9),
            seq: 2,
        };
        let mut items = vec![early.clone(), later.clone(), late.clone()];
        items.sort();
        assert_eq!(items, vec![late, later, early]);
    }

    #[test]
    fn test_penalty_cap() {
        let mut item = QueueItem {
            penalty: 2,
            cost: 1,
            enqueued_at: Instant::now(),
            seq: 0,
        };
        item.penalize(Some(3));
        item.penalize(Some(3));
        assert_eq!(item.penalty(), 3);
        item.penalize(None);
        assert_eq!(item.penalty(), 4);
    }

    #[test]
    fn test_dispatch_admits_in_order_and_penalizes_blocked_head() {
        let queue = queue(5);
        let now = Instant::now();
        let big = queue.enqueue(10, 0, now);
        let small = queue.enqueue(2, 0, now + Duration::from_millis(1));

        let mut state = queue.state.lock();
        // Head does not fit: nothing admitted, requeue scheduled.
        assert!(!queue.dispatch(&mut state, now));
        assert!(state.admitted.is_empty());

        // After the requeue interval the big item is pushed back and the
        // small one is admitted around it.
        assert!(queue.dispatch(&mut state, now + Duration::from_millis(20)));
        assert!(state.admitted.contains_key(&small));
        assert!(!state.admitted.contains_key(&big));
        let Reverse(head) = state.waiting.peek().cloned().expect("big still queued");
        assert_eq!(head.seq, big);
        assert_eq!(head.penalty(), 1);
    }

    #[test]
    fn test_timeout_removes_waiter() {
        let queue = queue(1);
        assert!(queue.try_admit(1).is_some());
        let err = queue
            .acquire_blocking(1, 0, Duration::from_millis(30))
            .expect_err("no capacity left");
        assert!(err.is_timeout());
        assert_eq!(queue.queued(), 0);
    }

    #[tokio::test]
    async fn test_dropped_future_leaves_queue() {
        let queue = queue(1);
        assert!(queue.try_admit(1).is_some());
        let pending = queue.acquire(1, 0, Duration::from_secs(5));
        let _ = tokio::time::timeout(Duration::from_millis(30), pending).await;
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    fn test_cancelling_admitted_waiter_returns_capacity() {
        let queue = queue(2);
        let now = Instant::now();
        let seq = queue.enqueue(2, 0, now);
        {
            let mut state = queue.state.lock();
            assert!(queue.dispatch(&mut state, now));
            assert!(state.admitted.contains_key(&seq));
            assert_eq!(state.ledger.used, 2);
        }

        // The owner never polls again.
        queue.cancel(seq);

        let state = queue.state.lock();
        assert!(state.admitted.is_empty());
        assert_eq!(state.ledger.used, 0);
    }

    #[test]
    fn test_release_returns_capacity() {
        let queue = queue(1);
        let reservation = queue.try_admit(1).expect("capacity available");
        assert!(queue.try_admit(1).is_none());
        queue.release(reservation);
        assert!(queue.try_admit(1).is_some());
    }
}
