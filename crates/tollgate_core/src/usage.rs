//! Token usage records.

/// Tokens consumed by one admitted request.
///
/// # Examples
///
/// ```
/// use tollgate_core::TokenUsage;
///
/// let usage = TokenUsage::new(120, 30);
/// assert_eq!(*usage.total_tokens(), 150);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, derive_getters::Getters)]
pub struct TokenUsage {
    /// Tokens in the prompt/input.
    input_tokens: u64,
    /// Tokens in the response/output.
    output_tokens: u64,
    /// Total tokens (input + output).
    total_tokens: u64,
}

impl TokenUsage {
    /// Create a new token usage record.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }

    /// Usage for a reservation made before the call, when only input is known.
    pub fn reserved(input_tokens: u64) -> Self {
        Self::new(input_tokens, 0)
    }
}

/// Results that know how many tokens the provider billed for them.
///
/// The retry wrapper records this usage after a successful call.
pub trait ReportsUsage {
    /// Usage reported by the provider, if any.
    fn token_usage(&self) -> Option<TokenUsage>;
}

impl ReportsUsage for TokenUsage {
    fn token_usage(&self) -> Option<TokenUsage> {
        Some(*self)
    }
}

impl ReportsUsage for Option<TokenUsage> {
    fn token_usage(&self) -> Option<TokenUsage> {
        *self
    }
}

impl ReportsUsage for () {
    fn token_usage(&self) -> Option<TokenUsage> {
        None
    }
}

impl ReportsUsage for String {
    fn token_usage(&self) -> Option<TokenUsage> {
        None
    }
}

impl<T> ReportsUsage for (T, TokenUsage) {
    fn token_usage(&self) -> Option<TokenUsage> {
        Some(self.1)
    }
}
