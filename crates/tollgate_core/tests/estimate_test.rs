//! Tests for request cost estimation.

use base64::Engine;
use tollgate_core::{
    CharacterCounter, ImageTokenPolicy, Input, MediaSource, Message, ReportsUsage, Role,
    TokenCounter, TokenEstimator, TokenUsage,
};

/// Minimal PNG: signature plus an IHDR chunk declaring 1200x500.
fn png_1200x500() -> Vec<u8> {
    let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&1200u32.to_be_bytes());
    bytes.extend_from_slice(&500u32.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    bytes
}

#[test]
fn test_character_counter_rounds_up() {
    let counter = CharacterCounter::default();
    assert_eq!(counter.count(""), 0);
    assert_eq!(counter.count("abc"), 1);
    assert_eq!(counter.count("abcd"), 1);
    assert_eq!(counter.count("abcde"), 2);
}

#[test]
fn test_tiktoken_counts_text() {
    let estimator = TokenEstimator::tiktoken().expect("Should load cl100k_base");
    let count = estimator.estimate_input(&Input::Text("Hello, world!".to_string()));
    assert!(count > 0);
    assert!(count < 10);
}

#[test]
fn test_image_fallback_is_conservative() {
    let policy = ImageTokenPolicy::default();
    // floor(1568 * 1568 / 600)
    assert_eq!(policy.fallback_tokens(), 4097);

    let url = MediaSource::Url("https://example.com/cat.png".to_string());
    assert_eq!(policy.tokens_for_source(&url), 4097);

    let garbage = MediaSource::Binary(vec![1, 2, 3]);
    assert_eq!(policy.tokens_for_source(&garbage), 4097);
}

#[test]
fn test_image_dimensions_from_binary_and_base64() {
    let policy = ImageTokenPolicy::default();
    let png = png_1200x500();

    assert_eq!(
        policy.tokens_for_source(&MediaSource::Binary(png.clone())),
        1000
    );

    let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
    assert_eq!(
        policy.tokens_for_source(&MediaSource::Base64(encoded.clone())),
        1000
    );

    let data_url = format!("data:image/png;base64,{}", encoded);
    assert_eq!(policy.tokens_for_source(&MediaSource::Base64(data_url)), 1000);
}

#[test]
fn test_custom_image_policy() {
    let policy = ImageTokenPolicy::new(750, 1000);
    assert_eq!(policy.tokens_for(1500, 1000), 2000);
    assert_eq!(policy.fallback_tokens(), 1333);
}

#[test]
fn test_estimate_messages_sums_text_and_images() {
    let estimator = TokenEstimator::new(CharacterCounter::default());
    let messages = vec![
        Message::text(Role::System, "You are terse."),
        Message {
            role: Role::User,
            content: vec![
                Input::Text("Describe this".to_string()),
                Input::Image {
                    mime: Some("image/png".to_string()),
                    source: MediaSource::Binary(png_1200x500()),
                },
            ],
        },
    ];

    // 14 chars -> 4, 13 chars -> 4, image -> 1000
    assert_eq!(estimator.estimate_messages(&messages), 1008);
}

#[test]
fn test_messages_roundtrip_through_serde() {
    let message = Message::text(Role::Assistant, "ok");
    let json = serde_json::to_string(&message).unwrap();
    assert!(json.contains("\"assistant\""));
    let parsed: Message = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, message);
}

#[test]
fn test_reports_usage() {
    let usage = TokenUsage::new(10, 5);
    assert_eq!(*usage.total_tokens(), 15);
    assert_eq!(("reply".to_string(), usage).token_usage(), Some(usage));
    assert_eq!("reply".to_string().token_usage(), None);
    assert_eq!(TokenUsage::reserved(7).output_tokens(), &0);
}
