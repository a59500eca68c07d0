//! Time-ordered usage log pruned to a trailing window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tollgate_core::TokenUsage;

/// Something that occupies capacity in a window.
pub(crate) trait Weight {
    fn weight(&self) -> u64;
}

impl Weight for u64 {
    fn weight(&self) -> u64 {
        *self
    }
}

impl Weight for TokenUsage {
    fn weight(&self) -> u64 {
        *self.total_tokens()
    }
}

/// Entries younger than `span` count towards `total`; older ones are pruned.
#[derive(Debug, Clone)]
pub(crate) struct RollingWindow<T> {
    span: Duration,
    entries: VecDeque<(Instant, T)>,
    total: u64,
}

impl<T: Weight> RollingWindow<T> {
    pub(crate) fn new(span: Duration) -> Self {
        Self {
            span,
            entries: VecDeque::new(),
            total: 0,
        }
    }

    /// Drop entries that have aged out of the window.
    pub(crate) fn prune(&mut self, now: Instant) {
        while let Some((at, entry)) = self.entries.front() {
            if now.duration_since(*at) < self.span {
                break;
            }
            self.total = self.total.saturating_sub(entry.weight());
            self.entries.pop_front();
        }
    }

    pub(crate) fn push(&mut self, now: Instant, entry: T) {
        self.total = self.total.saturating_add(entry.weight());
        self.entries.push_back((now, entry));
    }

    /// Summed weight of in-window entries (as of the last prune).
    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    /// Remove one entry pushed at `at` with the given weight.
    ///
    /// Returns false when no such entry is left, e.g. it already aged out.
    pub(crate) fn release(&mut self, at: Instant, weight: u64) -> bool {
        let found = self
            .entries
            .iter()
            .rposition(|(pushed, entry)| *pushed == at && entry.weight() == weight);
        match found {
            Some(index) => {
                self.entries.remove(index);
                self.total = self.total.saturating_sub(weight);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    /// When the oldest entry leaves the window.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.entries.front().map(|(at, _)| *at + self.span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_drops_only_expired_entries() {
        let start = Instant::now();
        let mut window = RollingWindow::new(Duration::from_secs(60));
        window.push(start, 5u64);
        window.push(start + Duration::from_secs(30), 7u64);

        window.prune(start + Duration::from_secs(59));
        assert_eq!(window.total(), 12);
        assert_eq!(window.len(), 2);

        window.prune(start + Duration::from_secs(60));
        assert_eq!(window.total(), 7);
        assert_eq!(window.len(), 1);
        assert_eq!(
            window.next_expiry(),
            Some(start + Duration::from_secs(90))
        );

        window.prune(start + Duration::from_secs(120));
        assert_eq!(window.total(), 0);
        assert_eq!(window.next_expiry(), None);
    }

    #[test]
    fn test_release_removes_matching_entry_only() {
        let start = Instant::now();
        let later = start + Duration::from_secs(1);
        let mut window = RollingWindow::new(Duration::from_secs(60));
        window.push(start, 3u64);
        window.push(later, 3u64);
        window.push(later, 5u64);

        assert!(window.release(later, 3));
        assert_eq!(window.total(), 8);
        assert_eq!(window.len(), 2);
        assert_eq!(window.next_expiry(), Some(start + Duration::from_secs(60)));

        // Already gone.
        assert!(!window.release(later, 3));
        assert_eq!(window.total(), 8);
    }

    #[test]
    fn test_token_usage_weight_is_total() {
        let start = Instant::now();
        let mut window = RollingWindow::new(Duration::from_secs(60));
        window.push(start, TokenUsage::new(100, 20));
        window.push(start, TokenUsage::reserved(30));
        assert_eq!(window.total(), 150);
    }
}
