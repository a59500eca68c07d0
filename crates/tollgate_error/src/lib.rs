//! Error types for tollgate.
//!
//! This crate provides the error types shared by the tollgate workspace and
//! the taxonomy used to decide whether a failed provider call is retried.
//!
//! # Error Hierarchy
//!
//! All errors follow the `ErrorKind` + wrapper struct pattern:
//! - `*ErrorKind` enum defines specific error conditions
//! - `*Error` struct wraps the kind with source location tracking
//! - All constructors use `#[track_caller]` for automatic location capture
//!
//! # Examples
//!
//! ```
//! use tollgate_error::{Classify, HttpError, ProviderErrorKind, TollgateResult};
//!
//! fn call_provider() -> TollgateResult<String> {
//!     Err(HttpError::with_status(503, "Service Unavailable"))?
//! }
//!
//! assert!(call_provider().is_err());
//! assert_eq!(
//!     HttpError::with_status(401, "Unauthorized").classify(),
//!     ProviderErrorKind::Authentication
//! );
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
mod error;
mod estimation;
mod http;
mod provider;
mod rate_limit;

pub use builder::{BuilderError, BuilderErrorKind};
pub use config::ConfigError;
pub use error::{TollgateError, TollgateErrorKind, TollgateResult};
pub use estimation::EstimationError;
pub use http::HttpError;
pub use provider::{Classify, ProviderError, ProviderErrorKind};
pub use rate_limit::{RateLimitError, RateLimitErrorKind};
