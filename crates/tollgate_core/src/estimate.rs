//! Request cost estimation for admission control.
//!
//! Estimates are approximations used to reserve capacity before a call, not
//! billing figures. Text goes through a [`TokenCounter`]; images are charged
//! by pixel area through an [`ImageTokenPolicy`].

use crate::{Input, MediaSource, Message};
use std::sync::{Arc, OnceLock};
use tiktoken_rs::CoreBPE;
use tollgate_error::EstimationError;
use tracing::{debug, instrument, warn};

static CL100K: OnceLock<Option<TiktokenCounter>> = OnceLock::new();

/// Counts tokens in a piece of text.
pub trait TokenCounter: Send + Sync {
    /// Number of tokens `text` encodes to.
    fn count(&self, text: &str) -> u64;
}

/// BPE token counter using the `cl100k_base` encoding.
///
/// Exact for GPT-family models and a close approximation for Claude, Groq
/// and embedding providers.
#[derive(Clone)]
pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    /// Load the `cl100k_base` encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoding data cannot be loaded.
    pub fn cl100k() -> Result<Self, EstimationError> {
        tiktoken_rs::cl100k_base()
            .map(|bpe| Self { bpe: Arc::new(bpe) })
            .map_err(|e| EstimationError::new(format!("Failed to load tokenizer: {}", e)))
    }

    /// Process-wide `cl100k_base` counter, loaded on first use.
    ///
    /// `None` when the encoding could not be loaded; the failure is logged
    /// once.
    pub fn shared() -> Option<Self> {
        CL100K
            .get_or_init(|| match Self::cl100k() {
                Ok(counter) => Some(counter),
                Err(e) => {
                    warn!(error = %e, "Tokenizer unavailable, estimates fall back to characters");
                    None
                }
            })
            .clone()
    }
}

impl std::fmt::Debug for TiktokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenCounter")
            .field("encoding", &"cl100k_base")
            .finish()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> u64 {
        self.bpe.encode_with_special_tokens(text).len() as u64
    }
}

/// Tokenizer-free counter: one token per `chars_per_token` characters,
/// rounded up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacterCounter {
    chars_per_token: u64,
}

impl CharacterCounter {
    /// Counter charging one token per `chars_per_token` characters.
    pub fn new(chars_per_token: u64) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharacterCounter {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenCounter for CharacterCounter {
    fn count(&self, text: &str) -> u64 {
        (text.chars().count() as u64).div_ceil(self.chars_per_token)
    }
}

/// Pixel-area pricing for image inputs.
///
/// An image of `width x height` costs `floor(width * height / pixels_per_token)`
/// tokens. When dimensions cannot be read (URL sources, unknown formats) the
/// image is charged as a `fallback_side x fallback_side` square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_getters::Getters)]
pub struct ImageTokenPolicy {
    /// Pixels charged per token.
    pixels_per_token: u64,
    /// Side length assumed for images of unknown size.
    fallback_side: u64,
}

impl ImageTokenPolicy {
    /// Create a policy with explicit constants.
    pub fn new(pixels_per_token: u64, fallback_side: u64) -> Self {
        Self {
            pixels_per_token: pixels_per_token.max(1),
            fallback_side,
        }
    }

    /// Tokens for an image of known dimensions.
    pub fn tokens_for(&self, width: u64, height: u64) -> u64 {
        width.saturating_mul(height) / self.pixels_per_token
    }

    /// Tokens charged when dimensions are unknown.
    pub fn fallback_tokens(&self) -> u64 {
        self.tokens_for(self.fallback_side, self.fallback_side)
    }

    /// Tokens for an image source, reading dimensions from inline data.
    pub fn tokens_for_source(&self, source: &MediaSource) -> u64 {
        let dimensions = source
            .bytes()
            .and_then(|bytes| imagesize::blob_size(&bytes).ok());

        match dimensions {
            Some(size) => self.tokens_for(size.width as u64, size.height as u64),
            None => {
                debug!("Image dimensions unavailable, using fallback estimate");
                self.fallback_tokens()
            }
        }
    }
}

impl Default for ImageTokenPolicy {
    fn default() -> Self {
        Self::new(600, 1568)
    }
}

/// Estimates the input token cost of a request.
///
/// # Examples
///
/// ```
/// use tollgate_core::{CharacterCounter, Message, Role, TokenEstimator};
///
/// let estimator = TokenEstimator::new(CharacterCounter::default());
/// let messages = vec![Message::text(Role::User, "12345678")];
/// assert_eq!(estimator.estimate_messages(&messages), 2);
/// ```
#[derive(Clone)]
pub struct TokenEstimator {
    counter: Arc<dyn TokenCounter>,
    images: ImageTokenPolicy,
}

impl TokenEstimator {
    /// Estimator using the given text counter and the default image policy.
    pub fn new(counter: impl TokenCounter + 'static) -> Self {
        Self {
            counter: Arc::new(counter),
            images: ImageTokenPolicy::default(),
        }
    }

    /// Estimator backed by the `cl100k_base` BPE.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoding cannot be loaded.
    pub fn tiktoken() -> Result<Self, EstimationError> {
        Ok(Self::new(TiktokenCounter::cl100k()?))
    }

    /// Estimator backed by the shared `cl100k_base` BPE, or by
    /// [`CharacterCounter::default`] if the encoding cannot be loaded.
    pub fn tokenizer_or_characters() -> Self {
        match TiktokenCounter::shared() {
            Some(counter) => Self::new(counter),
            None => Self::default(),
        }
    }

    /// Replace the image pricing policy.
    pub fn with_image_policy(mut self, images: ImageTokenPolicy) -> Self {
        self.images = images;
        self
    }

    /// The image pricing policy in use.
    pub fn image_policy(&self) -> &ImageTokenPolicy {
        &self.images
    }

    /// Tokens for a single input.
    pub fn estimate_input(&self, input: &Input) -> u64 {
        match input {
            Input::Text(text) => self.counter.count(text),
            Input::Image { source, .. } => self.images.tokens_for_source(source),
        }
    }

    /// Total input tokens across all messages.
    #[instrument(skip(self, messages), fields(messages = messages.len()))]
    pub fn estimate_messages(&self, messages: &[Message]) -> u64 {
        let total = messages
            .iter()
            .flat_map(|message| message.content.iter())
            .map(|input| self.estimate_input(input))
            .fold(0u64, u64::saturating_add);
        debug!(total, "Estimated request tokens");
        total
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(CharacterCounter::default())
    }
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("images", &self.images)
            .finish_non_exhaustive()
    }
}
