//! Errors raised by the admission and rate limiting layer.

/// Rate limiting error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum RateLimitErrorKind {
    /// Capacity would exceed a configured ceiling.
    #[display("Rate limit exceeded: {}", _0)]
    LimitExceeded(String),
    /// Waiting for capacity took longer than the caller allowed.
    #[display("Timed out after {:?} waiting for {}", waited, resource)]
    Timeout {
        /// What the caller was waiting on (e.g. "admission", "request bucket")
        resource: String,
        /// Time spent waiting before giving up
        waited: std::time::Duration,
    },
    /// The provider kept signalling throttling past the retry budget.
    #[display("Provider '{}' rate limited {} consecutive times (max retries {})", provider, failures, max_retries)]
    RetriesExhausted {
        /// Provider identifier
        provider: String,
        /// Consecutive rate-limit signals observed
        failures: u32,
        /// Configured retry budget
        max_retries: u32,
    },
}

impl RateLimitErrorKind {
    /// Check whether this condition is worth retrying after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            RateLimitErrorKind::LimitExceeded(_) | RateLimitErrorKind::Timeout { .. } => true,
            RateLimitErrorKind::RetriesExhausted { .. } => false,
        }
    }
}

/// Rate limiting error with location tracking.
///
/// # Examples
///
/// ```
/// use tollgate_error::{RateLimitError, RateLimitErrorKind};
///
/// let err = RateLimitError::new(RateLimitErrorKind::Timeout {
///     resource: "admission".to_string(),
///     waited: std::time::Duration::from_millis(50),
/// });
/// assert!(err.is_timeout());
/// assert!(format!("{}", err).contains("admission"));
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Rate Limit Error: {} at line {} in {}", kind, line, file)]
pub struct RateLimitError {
    kind: RateLimitErrorKind,
    line: u32,
    file: &'static str,
}

impl RateLimitError {
    /// Create a new rate limiting error with automatic location tracking.
    #[track_caller]
    pub fn new(kind: RateLimitErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Shorthand for a capacity-wait timeout.
    #[track_caller]
    pub fn timeout(resource: impl Into<String>, waited: std::time::Duration) -> Self {
        Self::new(RateLimitErrorKind::Timeout {
            resource: resource.into(),
            waited,
        })
    }

    /// Shorthand for an exceeded ceiling.
    #[track_caller]
    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(RateLimitErrorKind::LimitExceeded(message.into()))
    }

    /// Get the error kind.
    pub fn kind(&self) -> &RateLimitErrorKind {
        &self.kind
    }

    /// True when the error came from an elapsed capacity wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, RateLimitErrorKind::Timeout { .. })
    }
}

impl From<RateLimitErrorKind> for RateLimitError {
    #[track_caller]
    fn from(kind: RateLimitErrorKind) -> Self {
        Self::new(kind)
    }
}
