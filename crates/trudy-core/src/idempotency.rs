//! Idempotency records and request fingerprints.
//!
//! A client may send `X-Idempotency-Key` on creation requests. The first 2xx
//! response for a `(tenant, key)` pair is stored together with a fingerprint
//! of the request; an identical retry gets the stored response back
//! byte-for-byte and a different request reusing the key is a conflict.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::TenantId;

/// Default retention of idempotency records.
pub const DEFAULT_IDEMPOTENCY_TTL_DAYS: i64 = 7;

/// Headers that never contribute to a fingerprint.
///
/// The first six vary between retries of the same logical request; the rest
/// are set by HTTP clients and proxies.
pub const EXCLUDED_HEADERS: &[&str] = &[
    "x-request-id",
    "x-forwarded-for",
    "user-agent",
    "host",
    "authorization",
    "x-idempotency-key",
    "content-length",
    "accept-encoding",
    "connection",
];

/// The parts of a request that define its logical content.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    /// HTTP method, e.g. `POST`.
    pub method: String,
    /// Request path without query.
    pub path: String,
    /// Raw query string (without `?`), possibly empty.
    pub query: String,
    /// Request headers as received.
    pub headers: Vec<(String, String)>,
    /// Decoded JSON body (`Null` when empty).
    pub body: serde_json::Value,
}

impl CanonicalRequest {
    /// SHA-256 hex fingerprint of the request.
    ///
    /// Query parameters and headers are sorted, header names lowercased and
    /// [`EXCLUDED_HEADERS`] dropped; JSON object keys are sorted at every
    /// depth. Reordering any of these does not change the result.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut query: Vec<&str> = self.query.split('&').filter(|p| !p.is_empty()).collect();
        query.sort_unstable();

        let mut headers: Vec<(String, &str)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .filter(|(name, _)| !EXCLUDED_HEADERS.contains(&name.as_str()))
            .collect();
        headers.sort_unstable();

        let mut input = String::new();
        // Writing to a String cannot fail.
        let _ = write!(
            input,
            "{}:{}:{}:",
            self.method.to_ascii_uppercase(),
            self.path,
            query.join("&")
        );
        for (name, value) in &headers {
            let _ = write!(input, "{}={};", escape(name), escape(value));
        }
        input.push(':');
        if !self.body.is_null() {
            write_canonical_json(&self.body, &mut input);
        }

        hex::encode(Sha256::digest(input.as_bytes()))
    }
}

fn escape(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Serialize `value` with object keys sorted recursively.
pub fn write_canonical_json(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&escape(key));
                out.push(':');
                write_canonical_json(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Original HTTP status code.
    pub status_code: u16,
    /// Original body bytes (JSON text).
    pub body: String,
}

/// A stored `(tenant, key)` to response mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Tenant that sent the request.
    pub tenant_id: TenantId,
    /// Client-supplied key.
    pub key: String,
    /// Fingerprint of the first request.
    pub request_fingerprint: String,
    /// Response returned to the first request.
    pub response: CachedResponse,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
    /// When the record stops counting.
    pub expires_at: DateTime<Utc>,
}

/// Result of looking a request up against an existing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// Same key, same request: replay this response.
    Hit(CachedResponse),
    /// No live record: run the request.
    Miss,
    /// Same key, different request.
    Conflict,
}

impl IdempotencyRecord {
    /// Build a record that expires `ttl_days` after `now`.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        key: impl Into<String>,
        request_fingerprint: impl Into<String>,
        response: CachedResponse,
        ttl_days: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            key: key.into(),
            request_fingerprint: request_fingerprint.into(),
            response,
            created_at: now,
            expires_at: now + Duration::days(ttl_days),
        }
    }

    /// Whether the record has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Classify a request with `fingerprint` against an optional record.
    #[must_use]
    pub fn check(existing: Option<&Self>, fingerprint: &str, now: DateTime<Utc>) -> IdempotencyCheck {
        match existing {
            Some(record) if !record.is_expired(now) => {
                if record.request_fingerprint == fingerprint {
                    IdempotencyCheck::Hit(record.response.clone())
                } else {
                    IdempotencyCheck::Conflict
                }
            }
            _ => IdempotencyCheck::Miss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(headers: &[(&str, &str)], body: serde_json::Value) -> CanonicalRequest {
        CanonicalRequest {
            method: "POST".into(),
            path: "/v1/calls".into(),
            query: String::new(),
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            body,
        }
    }

    #[test]
    fn json_key_order_does_not_matter() {
        let a = request(&[], json!({"a": 1, "b": {"x": true, "y": [1, 2]}}));
        let b = request(&[], json!({"b": {"y": [1, 2], "x": true}, "a": 1}));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn array_order_matters() {
        let a = request(&[], json!({"ids": [1, 2]}));
        let b = request(&[], json!({"ids": [2, 1]}));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn body_change_changes_fingerprint() {
        let a = request(&[], json!({"phone_number": "+15550000001"}));
        let b = request(&[], json!({"phone_number": "+15550000002"}));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn excluded_headers_are_ignored() {
        let a = request(
            &[("Content-Type", "application/json"), ("Authorization", "Bearer a"), ("X-Request-Id", "1")],
            json!({}),
        );
        let b = request(
            &[("user-agent", "curl"), ("content-type", "application/json"), ("authorization", "Bearer b")],
            json!({}),
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn header_order_does_not_matter_but_values_do() {
        let a = request(&[("x-client-id", "c1"), ("content-type", "application/json")], json!({}));
        let b = request(&[("content-type", "application/json"), ("x-client-id", "c1")], json!({}));
        let c = request(&[("content-type", "application/json"), ("x-client-id", "c2")], json!({}));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn query_parameters_are_sorted() {
        let mut a = request(&[], serde_json::Value::Null);
        let mut b = a.clone();
        a.query = "b=2&a=1".into();
        b.query = "a=1&b=2".into();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        let fp = request(&[], json!({})).fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let mut out = String::new();
        write_canonical_json(&json!({"b": [{"d": 1, "c": "x"}], "a": null}), &mut out);
        assert_eq!(out, r#"{"a":null,"b":[{"c":"x","d":1}]}"#);
    }

    #[test]
    fn check_classifies_hit_miss_conflict_and_expiry() {
        let now = Utc::now();
        let response = CachedResponse {
            status_code: 201,
            body: r#"{"data":{}}"#.into(),
        };
        let record = IdempotencyRecord::new(TenantId::generate(), "abc", "fp1", response.clone(), 7, now);

        assert_eq!(IdempotencyRecord::check(None, "fp1", now), IdempotencyCheck::Miss);
        assert_eq!(
            IdempotencyRecord::check(Some(&record), "fp1", now),
            IdempotencyCheck::Hit(response)
        );
        assert_eq!(
            IdempotencyRecord::check(Some(&record), "fp2", now),
            IdempotencyCheck::Conflict
        );
        let later = now + Duration::days(7);
        assert_eq!(
            IdempotencyRecord::check(Some(&record), "fp1", later),
            IdempotencyCheck::Miss
        );
    }
}
