//! Tests for header-based rate limit detection.

use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;
use tollgate_rate_limit::{HeaderRateLimitDetector, RateLimitConfig};

fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(*name, HeaderValue::from_static(*value));
    }
    map
}

#[tokio::test]
async fn test_detect_anthropic_headers() {
    let detector = HeaderRateLimitDetector::new();
    let map = headers(&[
        ("anthropic-ratelimit-requests-limit", "50"),
        ("anthropic-ratelimit-requests-remaining", "49"),
        ("anthropic-ratelimit-tokens-limit", "40000"),
        ("anthropic-ratelimit-tokens-remaining", "38500"),
    ]);

    let limits = detector.detect("anthropic", &map).await.unwrap();
    assert_eq!(*limits.requests_per_minute(), Some(50));
    assert_eq!(*limits.tokens_per_minute(), Some(40_000));
    assert_eq!(*limits.requests_remaining(), Some(49));
    assert_eq!(*limits.tokens_remaining(), Some(38_500));
}

#[tokio::test]
async fn test_detect_openai_style_headers() {
    let detector = HeaderRateLimitDetector::new();
    let map = headers(&[
        ("x-ratelimit-limit-requests", "30"),
        ("x-ratelimit-limit-tokens", "6000"),
        ("x-ratelimit-remaining-requests", "29"),
    ]);

    let limits = detector.detect("groq", &map).await.unwrap();
    assert_eq!(*limits.requests_per_minute(), Some(30));
    assert_eq!(*limits.tokens_per_minute(), Some(6_000));
    assert_eq!(*limits.tokens_remaining(), None);
}

#[tokio::test]
async fn test_unrecognised_headers_leave_cache_alone() {
    let detector = HeaderRateLimitDetector::new();
    let map = headers(&[("x-ratelimit-limit-requests", "500")]);
    detector.detect("openai", &map).await.unwrap();

    let garbage = headers(&[
        ("content-type", "application/json"),
        ("x-ratelimit-limit-tokens", "lots"),
    ]);
    assert!(detector.detect("openai", &garbage).await.is_none());

    let cached = detector.cached("openai").await.unwrap();
    assert_eq!(*cached.requests_per_minute(), Some(500));

    detector.clear_cache().await;
    assert!(detector.cached("openai").await.is_none());
}

#[test]
fn test_retry_after_seconds() {
    assert_eq!(
        HeaderRateLimitDetector::retry_after(&headers(&[("retry-after", "12")])),
        Some(Duration::from_secs(12))
    );
    assert_eq!(
        HeaderRateLimitDetector::retry_after(&headers(&[("retry-after", "0.5")])),
        Some(Duration::from_millis(500))
    );
    assert_eq!(
        HeaderRateLimitDetector::retry_after(&headers(&[(
            "retry-after",
            "Wed, 21 Oct 2015 07:28:00 GMT"
        )])),
        None
    );
    assert_eq!(
        HeaderRateLimitDetector::retry_after(&headers(&[("retry-after", "-3")])),
        None
    );
    assert_eq!(HeaderRateLimitDetector::retry_after(&HeaderMap::new()), None);
}

#[test]
fn test_detected_limits_seed_config() {
    let detected = HeaderRateLimitDetector::parse_anthropic(&headers(&[(
        "anthropic-ratelimit-tokens-limit",
        "80000",
    )]));
    let base = RateLimitConfig::builder()
        .requests_per_minute(50)
        .tokens_per_minute(40_000)
        .max_retries(3)
        .build()
        .unwrap();

    let seeded = detected.apply_to(&base);
    assert_eq!(*seeded.requests_per_minute(), 50);
    assert_eq!(*seeded.tokens_per_minute(), 80_000);
    assert_eq!(*seeded.max_retries(), 3);
    assert_eq!(seeded.safe_tokens_per_minute(), 72_000);
}
