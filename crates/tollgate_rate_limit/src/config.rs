//! Rate limit configuration.
//!
//! Limits are plain values supplied once per provider. [`TollgateConfig`]
//! loads them from TOML with a precedence system:
//! - Bundled defaults (include_str! from tollgate.toml)
//! - User overrides (~/.config/tollgate/tollgate.toml, then ./tollgate.toml)
//! - Environment variables prefixed `TOLLGATE__`

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tollgate_error::{BuilderError, BuilderErrorKind, ConfigError, TollgateError, TollgateResult};
use tracing::{debug, instrument};

/// Fraction of every configured per-minute limit that is actually used.
pub const SAFETY_THRESHOLD: f64 = 0.9;

/// Upper bound on the per-attempt capacity wait.
pub const MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

fn default_requests_per_minute() -> u64 {
    60
}

fn default_tokens_per_minute() -> u64 {
    100_000
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    8
}

fn default_initial_retry_delay() -> f64 {
    1.0
}

fn default_max_retry_delay() -> f64 {
    64.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

/// Limits and retry policy for one provider.
///
/// Delays are in seconds. A limit of `0` means unlimited.
///
/// # Example
///
/// ```
/// use tollgate_rate_limit::RateLimitConfig;
///
/// let config = RateLimitConfig::builder()
///     .requests_per_minute(100)
///     .tokens_per_minute(50_000)
///     .build()
///     .unwrap();
/// assert_eq!(config.safe_requests_per_minute(), 90);
/// assert_eq!(*config.max_retries(), 8);
/// ```
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters, derive_builder::Builder,
)]
#[builder(default, build_fn(private, name = "build_internal"))]
pub struct RateLimitConfig {
    /// Requests allowed per minute
    #[serde(default = "default_requests_per_minute")]
    requests_per_minute: u64,

    /// Tokens allowed per minute
    #[serde(default = "default_tokens_per_minute")]
    tokens_per_minute: u64,

    /// Whether limiting applies at all
    #[serde(default = "default_enabled")]
    enabled: bool,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    max_retries: u32,

    /// Base delay of the exponential backoff
    #[serde(default = "default_initial_retry_delay")]
    initial_retry_delay: f64,

    /// Ceiling on any single backoff delay
    #[serde(default = "default_max_retry_delay")]
    max_retry_delay: f64,

    /// Fraction of each delay that is randomized
    #[serde(default = "default_jitter_factor")]
    jitter_factor: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            tokens_per_minute: default_tokens_per_minute(),
            enabled: default_enabled(),
            max_retries: default_max_retries(),
            initial_retry_delay: default_initial_retry_delay(),
            max_retry_delay: default_max_retry_delay(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RateLimitConfigBuilder {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a builder error when a value is out of range.
    pub fn build(&self) -> Result<RateLimitConfig, BuilderError> {
        let config = self.build_internal().map_err(|e| {
            BuilderError::new(BuilderErrorKind::ValidationFailed(e.to_string()))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl RateLimitConfig {
    /// Start a builder seeded with the defaults.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// Defaults with the given per-minute limits.
    pub fn with_limits(requests_per_minute: u64, tokens_per_minute: u64) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            ..Self::default()
        }
    }

    /// Defaults with limiting switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns a builder error naming the offending field.
    pub fn validate(&self) -> Result<(), BuilderError> {
        let invalid = |field: &str, reason: String| {
            Err(BuilderError::new(BuilderErrorKind::InvalidField {
                field: field.to_string(),
                reason,
            }))
        };

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return invalid(
                "jitter_factor",
                format!("{} is outside [0, 1]", self.jitter_factor),
            );
        }
        for (field, value) in [
            ("initial_retry_delay", self.initial_retry_delay),
            ("max_retry_delay", self.max_retry_delay),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(
                    field,
                    format!("{} is not a non-negative number of seconds", value),
                );
            }
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return invalid(
                "initial_retry_delay",
                format!(
                    "{} exceeds max_retry_delay {}",
                    self.initial_retry_delay, self.max_retry_delay
                ),
            );
        }
        Ok(())
    }

    /// Requests per minute after the safety margin.
    pub fn safe_requests_per_minute(&self) -> u64 {
        apply_safety_margin(self.requests_per_minute)
    }

    /// Tokens per minute after the safety margin.
    pub fn safe_tokens_per_minute(&self) -> u64 {
        apply_safety_margin(self.tokens_per_minute)
    }

    /// Capacity wait allowed for one acquisition attempt.
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_retry_delay)
            .unwrap_or(MAX_ATTEMPT_TIMEOUT)
            .min(MAX_ATTEMPT_TIMEOUT)
    }
}

/// `floor(limit * 0.9)` in integer arithmetic.
///
/// A positive limit never drops to `0`, which would read as unlimited.
fn apply_safety_margin(limit: u64) -> u64 {
    if limit == 0 {
        return 0;
    }
    ((u128::from(limit) * 9 / 10) as u64).max(1)
}

/// Per-provider limits loaded from configuration files.
///
/// # Example
///
/// ```no_run
/// use tollgate_rate_limit::TollgateConfig;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TollgateConfig::load()?;
/// let anthropic = config.provider("anthropic");
/// println!("Anthropic RPM: {}", anthropic.requests_per_minute());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, derive_getters::Getters)]
pub struct TollgateConfig {
    /// Limits for providers without their own section
    #[serde(default)]
    defaults: RateLimitConfig,

    /// Limits keyed by provider identifier
    #[serde(default)]
    providers: HashMap<String, RateLimitConfig>,
}

impl TollgateConfig {
    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> TollgateResult<Self> {
        debug!("Loading configuration from file");

        let config: Self = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .map_err(|e| {
                TollgateError::from(ConfigError::new(format!(
                    "Failed to read configuration from {}: {}",
                    path.as_ref().display(),
                    e
                )))
            })?
            .try_deserialize()
            .map_err(|e| {
                TollgateError::from(ConfigError::new(format!(
                    "Failed to parse configuration: {}",
                    e
                )))
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with precedence: environment > current dir > home dir > bundled.
    ///
    /// User config files are optional and silently skipped if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if a present source cannot be parsed or validated.
    #[instrument]
    pub fn load() -> TollgateResult<Self> {
        debug!(
            "Loading configuration with precedence: env > current dir > home dir > bundled defaults"
        );

        const DEFAULT_CONFIG: &str = include_str!("../../../tollgate.toml");

        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".config/tollgate/tollgate.toml");
            builder = builder.add_source(File::from(home_config).required(false));
        }

        builder = builder
            .add_source(File::with_name("tollgate").required(false))
            .add_source(
                Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder
            .build()
            .map_err(|e| {
                TollgateError::from(ConfigError::new(format!(
                    "Failed to build configuration: {}",
                    e
                )))
            })?
            .try_deserialize()
            .map_err(|e| {
                TollgateError::from(ConfigError::new(format!(
                    "Failed to parse configuration: {}",
                    e
                )))
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Limits for `provider` (case-insensitive), or the defaults.
    #[instrument(skip(self))]
    pub fn provider(&self, provider: &str) -> &RateLimitConfig {
        let found = self
            .providers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(provider))
            .map(|(_, config)| config);
        debug!(provider, configured = found.is_some(), "Looking up provider limits");
        found.unwrap_or(&self.defaults)
    }

    fn validate(&self) -> TollgateResult<()> {
        self.defaults.validate()?;
        for (name, config) in &self.providers {
            config.validate().map_err(|e| {
                TollgateError::from(ConfigError::new(format!(
                    "Invalid limits for provider '{}': {}",
                    name, e
                )))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_margin_floors() {
        assert_eq!(apply_safety_margin(60), 54);
        assert_eq!(apply_safety_margin(1), 1);
        assert_eq!(apply_safety_margin(0), 0);
        assert_eq!(apply_safety_margin(15), 13);
        assert_eq!(apply_safety_margin(u64::MAX), (u128::from(u64::MAX) * 9 / 10) as u64);
    }

    #[test]
    fn test_per_attempt_timeout_is_capped() {
        assert_eq!(RateLimitConfig::default().per_attempt_timeout(), MAX_ATTEMPT_TIMEOUT);
        let short = RateLimitConfig::builder()
            .initial_retry_delay(0.5)
            .max_retry_delay(2.0)
            .build()
            .unwrap();
        assert_eq!(short.per_attempt_timeout(), Duration::from_secs(2));
    }
}
