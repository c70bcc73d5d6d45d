//! Request wire model, unique-key normalization, and request-id derivation.
//!
//! A request's `uniqueKey` is the deduplication anchor: two adds with the
//! same unique key refer to the same queued request on every client.  When
//! the caller does not supply one it is derived from the URL by a
//! normalization that strips tracking noise (`utm_` parameters, fragments,
//! trailing slashes, parameter order).

use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a derived request id.
const REQUEST_ID_LENGTH: usize = 15;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A single URL to crawl, as stored in the remote queue.
///
/// Caller-supplied fields beyond the known ones are preserved verbatim in
/// `extra` and round-trip through the wire format untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Opaque id assigned by the remote service.  Absent before the first
    /// add.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Target URL.  Required, non-empty.
    pub url: String,
    /// Deduplication key.  Derived from `url` when absent on add.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    /// Set when the request has been handled; presence is what makes a
    /// request count as handled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
    /// Any additional caller-supplied fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Request {
    /// Convenience constructor for a plain URL request.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            id: None,
            url: url.into(),
            unique_key: None,
            handled_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request-id derivation
// ---------------------------------------------------------------------------

/// Derive the short request id for a unique key.
///
/// SHA-256 over the UTF-8 bytes, base64, with `+`, `/` and `=` stripped,
/// truncated to 15 characters.  Deterministic, so every client derives the
/// same id for the same unique key.
pub fn unique_key_to_request_id(unique_key: &str) -> String {
    let digest = Sha256::digest(unique_key.as_bytes());
    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    encoded
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(REQUEST_ID_LENGTH)
        .collect()
}

// ---------------------------------------------------------------------------
// URL normalization
// ---------------------------------------------------------------------------

/// Normalize a URL for use as a unique key.
///
/// Lower-cases the scheme and host, sorts query parameters, removes
/// parameters whose name starts with `utm_`, strips a trailing slash from
/// the path and drops the fragment unless `keep_fragment` is set.  Inputs
/// that do not parse as absolute URLs normalize to their trimmed selves.
pub fn normalize_url(url: &str, keep_fragment: bool) -> String {
    let trimmed = url.trim();
    let parsed = match Url::parse(trimmed) {
        Ok(parsed) => parsed,
        Err(_) => return trimmed.to_string(),
    };

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(name, _)| !name.starts_with("utm_"))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    params.sort();

    // The parser already lower-cased the scheme and host.
    let mut normalized = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or_default()
    );
    if let Some(port) = parsed.port() {
        normalized.push(':');
        normalized.push_str(&port.to_string());
    }
    normalized.push_str(parsed.path().trim_end_matches('/'));

    if !params.is_empty() {
        let query: Vec<String> = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        normalized.push('?');
        normalized.push_str(&query.join("&"));
    }

    if keep_fragment {
        if let Some(fragment) = parsed.fragment() {
            normalized.push('#');
            normalized.push_str(fragment);
        }
    }

    normalized
}

/// Compute the unique key for a request that was added without one.
pub fn compute_unique_key(url: &str, keep_fragment: bool) -> String {
    normalize_url(url, keep_fragment)
}
