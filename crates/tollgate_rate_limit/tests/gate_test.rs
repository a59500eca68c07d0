//! Tests for the provider gate and its retry wrapper.

use reqwest::header::{HeaderMap, HeaderValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tollgate_core::{CharacterCounter, Message, Role, TokenEstimator, TokenUsage};
use tollgate_error::{HttpError, ProviderErrorKind};
use tollgate_rate_limit::{ProviderGate, ProviderLimiterRegistry, RateLimitConfig};

fn fast_config(max_retries: u32) -> RateLimitConfig {
    RateLimitConfig::builder()
        .requests_per_minute(1_000)
        .tokens_per_minute(100_000)
        .max_retries(max_retries)
        .initial_retry_delay(0.001)
        .max_retry_delay(0.004)
        .jitter_factor(0.0)
        .build()
        .unwrap()
}

fn gate(provider: &str, config: RateLimitConfig) -> ProviderGate {
    ProviderGate::new(Arc::new(ProviderLimiterRegistry::new()), provider, config)
        .with_estimator(TokenEstimator::new(CharacterCounter::default()))
}

fn prompt() -> Vec<Message> {
    vec![Message::text(Role::User, "0123456789abcdef")]
}

#[tokio::test]
async fn test_authentication_failure_not_retried() {
    let gate = gate("anthropic", fast_config(5));
    let calls = AtomicU32::new(0);

    let err = gate
        .call(&prompt(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<TokenUsage, _>(HttpError::with_status(401, "invalid x-api-key")) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.kind(), ProviderErrorKind::Authentication);
    assert_eq!(err.status, Some(401));
}

#[tokio::test]
async fn test_unstatused_auth_failure_not_retried() {
    let gate = gate("anthropic", fast_config(3));
    let calls = AtomicU32::new(0);

    let err = gate
        .call(&prompt(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<TokenUsage, _>(HttpError::new("Invalid API key")) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.kind(), ProviderErrorKind::Authentication);
    assert_eq!(err.message, "Invalid API key");
    assert_eq!(gate.registry().consecutive_failures("anthropic"), 0);
    assert!(gate.registry().backoff_until("anthropic").is_none());
}

#[tokio::test]
async fn test_invalid_request_not_retried() {
    let gate = gate("openai", fast_config(5));
    let calls = AtomicU32::new(0);

    let err = gate
        .call(&prompt(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<TokenUsage, _>("malformed JSON body".to_string()) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.kind(), ProviderErrorKind::InvalidRequest);
}

#[tokio::test]
async fn test_rate_limit_failure_exhausts_retries() {
    let gate = gate("anthropic", fast_config(3));
    let calls = AtomicU32::new(0);

    let err = gate
        .call(&prompt(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<TokenUsage, _>(HttpError::with_status(429, "Too Many Requests")) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(err.kind(), ProviderErrorKind::RateLimit);
    assert_eq!(gate.registry().consecutive_failures("anthropic"), 4);
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let gate = gate("cohere", fast_config(3));
    let calls = AtomicU32::new(0);

    let usage = gate
        .call(&prompt(), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match attempt {
                    0 => Err("connection reset by peer".to_string()),
                    1 => Err("upstream returned 503".to_string()),
                    _ => Ok(TokenUsage::new(4, 40)),
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*usage.output_tokens(), 40);
}

#[tokio::test]
async fn test_success_records_output_and_resets_failures() {
    let gate = gate("groq", fast_config(3));
    let calls = AtomicU32::new(0);

    gate.call(&prompt(), || {
        let attempt = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Err(HttpError::with_status(429, "Too Many Requests"))
            } else {
                Ok(TokenUsage::new(4, 40))
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(gate.registry().consecutive_failures("groq"), 0);

    // Two admissions of 4 estimated tokens plus 40 recorded output tokens.
    let limiters = gate.registry().get_limiters("groq", gate.config());
    assert_eq!(*limiters.admission().usage().requests(), 2);
    assert_eq!(*limiters.admission().usage().tokens(), 48);
}

#[test]
fn test_blocking_call_matches_async_semantics() {
    let gate = gate("openai", fast_config(2));

    let calls = AtomicU32::new(0);
    let err = gate
        .call_blocking(&prompt(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<TokenUsage, _>(HttpError::with_status(403, "permission denied"))
        })
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.kind(), ProviderErrorKind::Authentication);

    let calls = AtomicU32::new(0);
    let err = gate
        .call_blocking(&prompt(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<TokenUsage, _>("request timeout after 30s".to_string())
        })
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(err.kind(), ProviderErrorKind::Timeout);

    let calls = AtomicU32::new(0);
    let reply = gate
        .call_blocking(&prompt(), || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HttpError::with_status(429, "slow down"))
            } else {
                Ok("done".to_string())
            }
        })
        .unwrap();
    assert_eq!(reply, "done");
    assert_eq!(gate.registry().consecutive_failures("openai"), 0);
}

#[tokio::test]
async fn test_acquire_capacity_times_out() {
    // Safe request limit of 1.
    let gate = gate("voyage", RateLimitConfig::with_limits(2, 1_000));
    gate.acquire_capacity(10, Duration::from_secs(1))
        .await
        .unwrap();

    let started = Instant::now();
    let err = gate
        .acquire_capacity(10, Duration::from_millis(60))
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(err.is_timeout());
    assert!(waited >= Duration::from_millis(60), "gave up after {waited:?}");
    assert!(waited < Duration::from_secs(1), "gave up after {waited:?}");
}

#[test]
fn test_acquire_capacity_blocking_times_out() {
    let gate = gate("voyage", RateLimitConfig::with_limits(2, 1_000));
    gate.acquire_capacity_blocking(10, Duration::from_secs(1))
        .unwrap();

    let err = gate
        .acquire_capacity_blocking(10, Duration::from_millis(40))
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_notify_rate_limited_from_headers_honours_retry_after() {
    let gate = gate("anthropic", fast_config(3));
    let mut headers = HeaderMap::new();
    headers.insert("retry-after", HeaderValue::from_static("0.25"));

    let delay = gate
        .notify_rate_limited_from_headers(&headers)
        .await
        .unwrap();
    assert_eq!(delay, Duration::from_millis(250));
    assert_eq!(gate.registry().consecutive_failures("anthropic"), 1);

    let delay = gate.notify_rate_limited().await.unwrap();
    assert_eq!(delay, Duration::from_millis(4));
    let delay = gate.notify_rate_limited_blocking().unwrap();
    assert_eq!(delay, Duration::from_millis(4));
}

#[tokio::test]
async fn test_record_usage_through_gate() {
    let gate = gate("cohere", RateLimitConfig::with_limits(100, 1_000));
    gate.acquire_capacity(100, Duration::from_secs(1))
        .await
        .unwrap();
    gate.record_usage(0, 50).unwrap();

    let limiters = gate.registry().get_limiters("cohere", gate.config());
    assert_eq!(*limiters.admission().usage().tokens(), 150);
}

#[tokio::test]
async fn test_record_usage_resets_failures_between_cycles() {
    let gate = gate("groq", fast_config(2));

    for cycle in 0..4 {
        gate.acquire_capacity(10, Duration::from_secs(1))
            .await
            .unwrap();
        gate.notify_rate_limited()
            .await
            .unwrap_or_else(|e| panic!("cycle {cycle}: {e}"));
        assert_eq!(gate.registry().consecutive_failures("groq"), 1);

        gate.acquire_capacity(10, Duration::from_secs(1))
            .await
            .unwrap();
        gate.record_usage(0, 5).unwrap();
        assert_eq!(gate.registry().consecutive_failures("groq"), 0);
    }
}

#[test]
fn test_record_success_clears_failures() {
    let gate = gate("voyage", fast_config(3));
    gate.notify_rate_limited_blocking().unwrap();
    gate.notify_rate_limited_blocking().unwrap();
    assert_eq!(gate.registry().consecutive_failures("voyage"), 2);

    gate.record_success();
    assert_eq!(gate.registry().consecutive_failures("voyage"), 0);
}

#[test]
fn test_default_estimator_counts_with_tokenizer() {
    let gate = ProviderGate::new(
        Arc::new(ProviderLimiterRegistry::new()),
        "openai",
        RateLimitConfig::default(),
    );
    let messages = vec![Message::text(Role::User, "hello hello hello hello")];
    // cl100k encodes each word as one token; four characters per token would give 6.
    assert_eq!(gate.estimate(&messages), 4);
}
