//! Media source types for multimodal content.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Where media content is sourced from.
///
/// # Examples
///
/// ```
/// use tollgate_core::MediaSource;
///
/// let url = MediaSource::Url("https://example.com/image.png".to_string());
/// let base64 = MediaSource::Base64("iVBORw0KGgo...".to_string());
/// let binary = MediaSource::Binary(vec![0x89, 0x50, 0x4E, 0x47]);
/// assert!(url.bytes().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaSource {
    /// URL to fetch the content from
    Url(String),
    /// Base64-encoded content, optionally as a `data:` URL
    Base64(String),
    /// Raw binary data
    Binary(Vec<u8>),
}

impl MediaSource {
    /// Inline bytes of the media, decoding base64 when needed.
    ///
    /// Returns `None` for URLs and for base64 that fails to decode.
    pub fn bytes(&self) -> Option<std::borrow::Cow<'_, [u8]>> {
        match self {
            MediaSource::Url(_) => None,
            MediaSource::Binary(data) => Some(std::borrow::Cow::Borrowed(data.as_slice())),
            MediaSource::Base64(encoded) => {
                // data:image/png;base64,<payload>
                let payload = match encoded.split_once(";base64,") {
                    Some((prefix, payload)) if prefix.starts_with("data:") => payload,
                    _ => encoded.as_str(),
                };
                base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .ok()
                    .map(std::borrow::Cow::Owned)
            }
        }
    }
}
