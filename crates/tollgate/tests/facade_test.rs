//! End-to-end tests through the facade crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tollgate::{
    CharacterCounter, HttpError, Input, MediaSource, Message, ProviderErrorKind, ProviderGate,
    ProviderLimiterRegistry, QueueSettings, RateLimitConfig, Role, TokenEstimator, TokenUsage,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gates_share_provider_state() {
    let registry = Arc::new(ProviderLimiterRegistry::with_settings(
        QueueSettings::default().with_window(Duration::from_millis(100)),
    ));
    let config = RateLimitConfig::builder()
        .requests_per_minute(4)
        .tokens_per_minute(0)
        .initial_retry_delay(0.001)
        .max_retry_delay(0.5)
        .jitter_factor(0.0)
        .build()
        .unwrap();

    let chat = ProviderGate::new(Arc::clone(&registry), "anthropic", config.clone());
    let embed = ProviderGate::new(Arc::clone(&registry), "anthropic", config);
    let messages = vec![Message::text(Role::User, "hello")];

    let calls = Arc::new(AtomicU32::new(0));
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let gate = if i % 2 == 0 { chat.clone() } else { embed.clone() };
            let messages = messages.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                gate.call(&messages, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, HttpError>(TokenUsage::new(2, 3)) }
                })
                .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert_eq!(registry.providers(), vec!["anthropic".to_string()]);
}

#[tokio::test]
async fn test_image_inputs_priced_by_policy() {
    let registry = Arc::new(ProviderLimiterRegistry::new());
    let gate = ProviderGate::new(registry, "openai", RateLimitConfig::with_limits(100, 10_000))
        .with_estimator(TokenEstimator::new(CharacterCounter::default()));

    let messages = vec![Message {
        role: Role::User,
        content: vec![
            Input::Text("describe".to_string()),
            Input::Image {
                mime: Some("image/png".to_string()),
                source: MediaSource::Url("https://example.com/cat.png".to_string()),
            },
        ],
    }];

    // Unreadable dimensions fall back to a 1568x1568 estimate.
    assert_eq!(gate.estimate(&messages), 2 + 1568 * 1568 / 600);
}

#[test]
fn test_fatal_errors_surface_classified() {
    let gate = ProviderGate::new(
        Arc::new(ProviderLimiterRegistry::new()),
        "cohere",
        RateLimitConfig::with_limits(100, 10_000),
    );

    let err = gate
        .call_blocking(&[], || Err::<(), _>(HttpError::with_status(400, "bad request")))
        .unwrap_err();
    assert_eq!(err.kind(), ProviderErrorKind::InvalidRequest);
}
