//! Errors raised while building validated configuration values.

/// Why a builder refused to produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum BuilderErrorKind {
    /// A single field holds a value outside its allowed range.
    #[display("Field '{}' rejected: {}", field, reason)]
    InvalidField {
        /// Name of the offending field
        field: String,
        /// What the value violated
        reason: String,
    },

    /// The generated builder failed before field validation ran.
    #[display("Could not assemble value: {}", _0)]
    ValidationFailed(String),
}

/// Builder failure with the location that raised it.
///
/// # Examples
///
/// ```
/// use tollgate_error::{BuilderError, BuilderErrorKind};
///
/// let err = BuilderError::new(BuilderErrorKind::InvalidField {
///     field: "jitter_factor".to_string(),
///     reason: "must be within [0, 1]".to_string(),
/// });
/// assert!(format!("{}", err).contains("jitter_factor"));
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Builder Error: {} at line {} in {}", kind, line, file)]
pub struct BuilderError {
    kind: BuilderErrorKind,
    line: u32,
    file: &'static str,
}

impl BuilderError {
    /// Wrap `kind`, recording the caller's location.
    #[track_caller]
    pub fn new(kind: BuilderErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// What went wrong.
    pub fn kind(&self) -> &BuilderErrorKind {
        &self.kind
    }
}
