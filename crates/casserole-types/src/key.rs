//! Content-addressed key derivation.
//!
//! Mirrors the original `GenerateKey` algorithm: a fixed-field-order JSON
//! record of the object's identity is hashed with SHA-256 to produce a
//! stable, hex-encoded content key. Two responses with identical identity
//! fields always produce identical keys; headers irrelevant to identity
//! never leak into the record.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

/// The fixed-order identity record that gets hashed to form a content key.
///
/// Field order matters: it is part of the hash input, so changing it would
/// change every previously issued content key. `skip_serializing_if` mirrors
/// Go's `json:",omitempty"` so absent identity fields don't perturb the hash.
#[derive(Debug, Serialize)]
struct KeyFields {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha512: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_retrieved: Option<String>,
}

fn normalize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers.iter().map(|(k, v)| (k.to_lowercase(), v.clone())).collect()
}

/// Parses an HTTP date header value into an UTC `httpdate`-style string.
/// Falls back to the raw value if the header can't be parsed as a date
/// (callers only pass this to `Last-Modified`/`X-Cache-Date-Retrieved`,
/// which are always standard HTTP-date values in practice).
fn normalize_http_date(value: &str) -> String {
    match httpdate::parse_http_date(value) {
        Ok(time) => httpdate::fmt_http_date(time),
        Err(_) => value.to_string(),
    }
}

/// Computes the content key for `url` given a normalized header map.
///
/// Identity is taken from the first available of: ETag, SHA-512, SHA-256,
/// SHA-1, Content-MD5; failing that, Last-Modified (normalized to UTC);
/// failing that, X-Cache-Date-Retrieved (normalized to UTC). Content-Length
/// and Content-Encoding are folded in when present.
pub fn generate_content_key(url: &Url, headers: &HashMap<String, String>) -> String {
    let normalized = normalize_headers(headers);

    let content_length =
        normalized.get("content-length").and_then(|v| v.parse::<u64>().ok());
    let content_encoding = normalized.get("content-encoding").cloned();

    let last_retrieved = normalized
        .get("x-cache-date-retrieved")
        .map(|v| normalize_http_date(v));

    let mut fields = KeyFields {
        url: url.to_string(),
        content_length,
        content_encoding,
        etag: None,
        sha512: None,
        sha256: None,
        sha1: None,
        content_md5: None,
        last_modified: None,
        last_retrieved: None,
    };

    if let Some(v) = normalized.get("etag") {
        fields.etag = Some(v.clone());
    } else if let Some(v) = normalized.get("sha512") {
        fields.sha512 = Some(v.clone());
    } else if let Some(v) = normalized.get("sha256") {
        fields.sha256 = Some(v.clone());
    } else if let Some(v) = normalized.get("sha1") {
        fields.sha1 = Some(v.clone());
    } else if let Some(v) = normalized.get("content-md5") {
        fields.content_md5 = Some(v.clone());
    } else if let Some(v) = normalized.get("last-modified") {
        fields.last_modified = Some(normalize_http_date(v));
    } else {
        fields.last_retrieved = last_retrieved;
    }

    let json = serde_json::to_vec(&fields).expect("KeyFields always serializes");
    let digest = Sha256::digest(&json);
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn same_identity_same_key() {
        let url = Url::parse("http://mirror.example/pkg.tar.gz").unwrap();
        let a = generate_content_key(&url, &headers(&[("ETag", "\"v1\"")]));
        let b = generate_content_key(&url, &headers(&[("etag", "\"v1\"")]));
        assert_eq!(a, b);
    }

    #[test]
    fn differing_identity_differs() {
        let url = Url::parse("http://mirror.example/pkg.tar.gz").unwrap();
        let a = generate_content_key(&url, &headers(&[("ETag", "\"v1\"")]));
        let b = generate_content_key(&url, &headers(&[("ETag", "\"v2\"")]));
        assert_ne!(a, b);
    }

    #[test]
    fn falls_back_through_identity_chain() {
        let url = Url::parse("http://mirror.example/pkg.tar.gz").unwrap();
        let with_md5 =
            generate_content_key(&url, &headers(&[("Content-MD5", "abc123")]));
        let with_last_modified = generate_content_key(
            &url,
            &headers(&[("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT")]),
        );
        assert_ne!(with_md5, with_last_modified);
    }

    #[test]
    fn content_length_and_encoding_participate_in_the_hash() {
        let url = Url::parse("http://mirror.example/pkg.tar.gz").unwrap();
        let base = headers(&[("ETag", "\"v1\"")]);
        let mut with_length = base.clone();
        with_length.insert("Content-Length".to_string(), "100".to_string());
        assert_ne!(
            generate_content_key(&url, &base),
            generate_content_key(&url, &with_length)
        );
    }
}
