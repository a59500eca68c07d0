//! Provider error taxonomy and classification.
//!
//! Upstream LLM and embedding clients fail in many shapes. Before the retry
//! wrapper decides what to do it folds every failure into one of seven kinds:
//!
//! | Kind | Retried |
//! |---|---|
//! | `RateLimit` | yes, and triggers provider-wide backoff |
//! | `Timeout` | yes |
//! | `Connection` | yes |
//! | `Provider` | yes |
//! | `Authentication` | no |
//! | `InvalidRequest` | no |
//! | `RetriesExhausted` | no |
//!
//! Structured signals (HTTP status, typed client errors) are consulted first.
//! Matching on the lower-cased message text is the last resort for opaque
//! errors. Only the underlying message is matched, never the location suffix
//! the error wrappers add to their `Display` output.

use crate::{RateLimitError, RateLimitErrorKind};

const RATE_LIMIT_KEYWORDS: &[&str] = &["rate", "429", "overloaded"];
const TIMEOUT_KEYWORDS: &[&str] = &["timeout"];
const CONNECTION_KEYWORDS: &[&str] = &["connection", "network", "socket"];
const AUTHENTICATION_KEYWORDS: &[&str] = &["auth", "key", "permission"];
const INVALID_REQUEST_KEYWORDS: &[&str] = &["invalid", "malformed", "bad request"];

/// Kinds of provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub enum ProviderErrorKind {
    /// Provider signalled throttling
    #[display("rate limited")]
    RateLimit,
    /// Capacity wait or provider call timed out
    #[display("timeout")]
    Timeout,
    /// Network failure
    #[display("connection failure")]
    Connection,
    /// Generic upstream failure
    #[display("provider failure")]
    Provider,
    /// Bad credentials
    #[display("authentication failure")]
    Authentication,
    /// Malformed request
    #[display("invalid request")]
    InvalidRequest,
    /// The provider kept throttling past the retry budget
    #[display("retries exhausted")]
    RetriesExhausted,
}

impl ProviderErrorKind {
    /// Check if this kind of failure should be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProviderErrorKind::Authentication
                | ProviderErrorKind::InvalidRequest
                | ProviderErrorKind::RetriesExhausted
        )
    }

    /// Classify an HTTP status code.
    ///
    /// Returns `None` for statuses that say nothing about failure (2xx, 3xx)
    /// or that have no dedicated mapping.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            429 => Some(ProviderErrorKind::RateLimit),
            408 | 504 => Some(ProviderErrorKind::Timeout),
            401 | 403 => Some(ProviderErrorKind::Authentication),
            400 | 404 | 413 | 422 => Some(ProviderErrorKind::InvalidRequest),
            529 => Some(ProviderErrorKind::RateLimit),
            500..=599 => Some(ProviderErrorKind::Provider),
            _ => None,
        }
    }

    /// Classify free-form error text by keyword.
    ///
    /// # Examples
    ///
    /// ```
    /// use tollgate_error::ProviderErrorKind;
    ///
    /// assert_eq!(ProviderErrorKind::from_message("HTTP 429 Too Many Requests"), ProviderErrorKind::RateLimit);
    /// assert_eq!(ProviderErrorKind::from_message("Invalid API key"), ProviderErrorKind::Authentication);
    /// assert_eq!(ProviderErrorKind::from_message("something odd"), ProviderErrorKind::Provider);
    /// ```
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_lowercase();
        let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

        if contains_any(RATE_LIMIT_KEYWORDS) {
            ProviderErrorKind::RateLimit
        } else if contains_any(TIMEOUT_KEYWORDS) {
            ProviderErrorKind::Timeout
        } else if contains_any(CONNECTION_KEYWORDS) {
            ProviderErrorKind::Connection
        } else if contains_any(AUTHENTICATION_KEYWORDS) {
            ProviderErrorKind::Authentication
        } else if contains_any(INVALID_REQUEST_KEYWORDS) {
            ProviderErrorKind::InvalidRequest
        } else {
            ProviderErrorKind::Provider
        }
    }
}

/// Classified provider failure with source location.
///
/// # Examples
///
/// ```
/// use tollgate_error::{ProviderError, ProviderErrorKind};
///
/// let err = ProviderError::new(ProviderErrorKind::Authentication, "invalid x-api-key");
/// assert!(!err.is_retryable());
/// assert!(format!("{}", err).contains("authentication failure"));
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Provider Error ({}): {} at line {} in {}", kind, message, line, file)]
pub struct ProviderError {
    /// Classified failure kind
    pub kind: ProviderErrorKind,
    /// Message of the underlying failure
    pub message: String,
    /// HTTP status, when the failure carried one
    pub status: Option<u16>,
    /// Line number where error was created
    pub line: u32,
    /// File where error was created
    pub file: &'static str,
}

impl ProviderError {
    /// Create a new ProviderError with automatic location tracking.
    #[track_caller]
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            message: message.into(),
            status: None,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Classify an arbitrary failure into a ProviderError.
    #[track_caller]
    pub fn from_failure<E: Classify + ?Sized>(err: &E) -> Self {
        let mut classified = Self::new(err.classify(), err.message());
        classified.status = err.status_code();
        classified
    }

    /// Get the error kind.
    pub fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    /// Check if the failure should be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<RateLimitError> for ProviderError {
    #[track_caller]
    fn from(err: RateLimitError) -> Self {
        ProviderError::from_failure(&err)
    }
}

/// Folds a failure into a [`ProviderErrorKind`].
///
/// Implementors override [`Classify::error_kind`] or [`Classify::status_code`]
/// when they carry structured information; the default falls back to keyword
/// matching on [`Classify::message`].
pub trait Classify: std::fmt::Display {
    /// A kind known without inspecting text.
    fn error_kind(&self) -> Option<ProviderErrorKind> {
        None
    }

    /// HTTP status attached to the failure, if any.
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Text of the failure without location decoration.
    ///
    /// Defaults to the `Display` output. Wrappers whose `Display` appends a
    /// source location override this with the bare message.
    fn message(&self) -> String {
        self.to_string()
    }

    /// Classify the failure: explicit kind, then status, then message text.
    fn classify(&self) -> ProviderErrorKind {
        if let Some(kind) = self.error_kind() {
            return kind;
        }
        if let Some(kind) = self.status_code().and_then(ProviderErrorKind::from_status) {
            return kind;
        }
        ProviderErrorKind::from_message(&self.message())
    }
}

impl Classify for ProviderError {
    fn error_kind(&self) -> Option<ProviderErrorKind> {
        Some(self.kind)
    }

    fn status_code(&self) -> Option<u16> {
        self.status
    }

    fn message(&self) -> String {
        self.message.clone()
    }
}

impl Classify for RateLimitError {
    fn error_kind(&self) -> Option<ProviderErrorKind> {
        Some(match self.kind() {
            RateLimitErrorKind::LimitExceeded(_) => ProviderErrorKind::RateLimit,
            RateLimitErrorKind::Timeout { .. } => ProviderErrorKind::Timeout,
            RateLimitErrorKind::RetriesExhausted { .. } => ProviderErrorKind::RetriesExhausted,
        })
    }

    fn message(&self) -> String {
        self.kind().to_string()
    }
}

impl Classify for crate::HttpError {
    fn status_code(&self) -> Option<u16> {
        self.status
    }

    fn message(&self) -> String {
        self.message.clone()
    }
}

impl Classify for std::io::Error {
    fn error_kind(&self) -> Option<ProviderErrorKind> {
        use std::io::ErrorKind;

        match self.kind() {
            ErrorKind::TimedOut => Some(ProviderErrorKind::Timeout),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => Some(ProviderErrorKind::Connection),
            ErrorKind::PermissionDenied => Some(ProviderErrorKind::Authentication),
            ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                Some(ProviderErrorKind::InvalidRequest)
            }
            _ => None,
        }
    }
}

impl Classify for String {}

impl Classify for &str {}

#[cfg(feature = "reqwest")]
impl Classify for reqwest::Error {
    fn error_kind(&self) -> Option<ProviderErrorKind> {
        if self.is_timeout() {
            Some(ProviderErrorKind::Timeout)
        } else if self.is_connect() {
            Some(ProviderErrorKind::Connection)
        } else if self.is_builder() {
            Some(ProviderErrorKind::InvalidRequest)
        } else {
            None
        }
    }

    fn status_code(&self) -> Option<u16> {
        self.status().map(|status| status.as_u16())
    }
}
