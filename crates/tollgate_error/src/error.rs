//! Top-level error wrapper types.

use crate::{BuilderError, ConfigError, EstimationError, HttpError, ProviderError, RateLimitError};

/// Every failure tollgate can report.
///
/// # Examples
///
/// ```
/// use tollgate_error::{TollgateError, HttpError};
///
/// let http_err = HttpError::new("Connection failed");
/// let err: TollgateError = http_err.into();
/// assert!(format!("{}", err).contains("HTTP Error"));
/// ```
#[derive(Debug, derive_more::From, derive_more::Display, derive_more::Error)]
pub enum TollgateErrorKind {
    /// HTTP error
    #[from(HttpError)]
    Http(HttpError),
    /// Configuration error
    #[from(ConfigError)]
    Config(ConfigError),
    /// Builder error
    #[from(BuilderError)]
    Builder(BuilderError),
    /// Admission or rate limiting error
    #[from(RateLimitError)]
    RateLimit(RateLimitError),
    /// Classified provider failure
    #[from(ProviderError)]
    Provider(ProviderError),
    /// Token estimation error
    #[from(EstimationError)]
    Estimation(EstimationError),
}

/// Tollgate error with kind discrimination.
///
/// # Examples
///
/// ```
/// use tollgate_error::{TollgateResult, ConfigError};
///
/// fn might_fail() -> TollgateResult<()> {
///     Err(ConfigError::new("Missing field"))?
/// }
///
/// assert!(might_fail().is_err());
/// ```
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("Tollgate Error: {}", _0)]
pub struct TollgateError(Box<TollgateErrorKind>);

impl TollgateError {
    /// Create a new error from a kind.
    pub fn new(kind: TollgateErrorKind) -> Self {
        Self(Box::new(kind))
    }

    /// Get the error kind.
    pub fn kind(&self) -> &TollgateErrorKind {
        &self.0
    }
}

// Generic From implementation for any type that converts to TollgateErrorKind
impl<T> From<T> for TollgateError
where
    T: Into<TollgateErrorKind>,
{
    fn from(err: T) -> Self {
        Self::new(err.into())
    }
}

/// Result type for tollgate operations.
pub type TollgateResult<T> = std::result::Result<T, TollgateError>;
