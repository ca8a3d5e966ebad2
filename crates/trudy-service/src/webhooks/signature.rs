//! Ingress webhook signature verification.
//!
//! Both providers sign `"{timestamp}.{raw_body}"` with HMAC-SHA256 and send the
//! hex digest. Verification runs on the raw body bytes before any JSON
//! decoding, and the timestamp must be recent.

use crate::crypto::{constant_time_eq, sign_webhook};

/// Ultravox signature header.
pub const ULTRAVOX_SIGNATURE_HEADER: &str = "x-ultravox-signature";
/// Ultravox timestamp header.
pub const ULTRAVOX_TIMESTAMP_HEADER: &str = "x-ultravox-timestamp";
/// Stripe signature header (`t=<ts>,v1=<sig>,...`).
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// How far in the future a timestamp may be before it is rejected.
pub const MAX_FUTURE_SKEW_SECONDS: i64 = 60;

/// Why a webhook signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// No secret is configured for this source.
    #[error("webhook secret not configured")]
    MissingSecret,

    /// A required header is absent.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// A header could not be parsed.
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    /// The timestamp is older than the allowed age.
    #[error("timestamp too old")]
    Stale,

    /// The timestamp is too far in the future.
    #[error("timestamp in the future")]
    FromFuture,

    /// The body is not UTF-8.
    #[error("body is not valid UTF-8")]
    InvalidBody,

    /// No signature matched.
    #[error("signature mismatch")]
    Mismatch,
}

/// Verify an Ultravox delivery.
///
/// # Errors
///
/// Returns the first check that failed.
pub fn verify_ultravox(
    secret: Option<&str>,
    signature: Option<&str>,
    timestamp: Option<&str>,
    body: &[u8],
    max_age_seconds: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or(SignatureError::MissingSecret)?;
    let signature = signature.ok_or(SignatureError::MissingHeader(ULTRAVOX_SIGNATURE_HEADER))?;
    let timestamp: i64 = timestamp
        .ok_or(SignatureError::MissingHeader(ULTRAVOX_TIMESTAMP_HEADER))?
        .trim()
        .parse()
        .map_err(|_| SignatureError::MalformedHeader(ULTRAVOX_TIMESTAMP_HEADER))?;
    let body = std::str::from_utf8(body).map_err(|_| SignatureError::InvalidBody)?;

    let expected = sign_webhook(secret, timestamp, body);
    if !constant_time_eq(&expected, signature.trim()) {
        return Err(SignatureError::Mismatch);
    }
    check_freshness(timestamp, max_age_seconds, now)
}

/// Verify a Stripe delivery. Any `v1` signature in the header may match.
///
/// # Errors
///
/// Returns the first check that failed.
pub fn verify_stripe(
    secret: Option<&str>,
    header: Option<&str>,
    body: &[u8],
    max_age_seconds: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or(SignatureError::MissingSecret)?;
    let header = header.ok_or(SignatureError::MissingHeader(STRIPE_SIGNATURE_HEADER))?;
    let (timestamp, signatures) = parse_stripe_header(header)?;
    let body = std::str::from_utf8(body).map_err(|_| SignatureError::InvalidBody)?;

    let expected = sign_webhook(secret, timestamp, body);
    if !signatures.iter().any(|sig| constant_time_eq(&expected, sig)) {
        return Err(SignatureError::Mismatch);
    }
    check_freshness(timestamp, max_age_seconds, now)
}

/// Split a `Stripe-Signature` header into its timestamp and `v1` signatures.
///
/// # Errors
///
/// Returns `MalformedHeader` if `t` is missing or not an integer, or if no
/// `v1` entry is present.
pub fn parse_stripe_header(header: &str) -> Result<(i64, Vec<&str>), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::MalformedHeader(STRIPE_SIGNATURE_HEADER))?,
                );
            }
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader(STRIPE_SIGNATURE_HEADER))?;
    if signatures.is_empty() {
        return Err(SignatureError::MalformedHeader(STRIPE_SIGNATURE_HEADER));
    }
    Ok((timestamp, signatures))
}

fn check_freshness(timestamp: i64, max_age_seconds: i64, now: i64) -> Result<(), SignatureError> {
    if now.saturating_sub(timestamp) > max_age_seconds {
        return Err(SignatureError::Stale);
    }
    if timestamp > now.saturating_add(MAX_FUTURE_SKEW_SECONDS) {
        return Err(SignatureError::FromFuture);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"event":"call.started","call_id":"uv_1"}"#;
    const NOW: i64 = 1_700_000_000;

    fn sign(ts: i64, body: &[u8]) -> String {
        sign_webhook(SECRET, ts, std::str::from_utf8(body).unwrap())
    }

    fn ultravox(sig: &str, ts: i64, body: &[u8]) -> Result<(), SignatureError> {
        verify_ultravox(Some(SECRET), Some(sig), Some(&ts.to_string()), body, 300, NOW)
    }

    #[test]
    fn valid_ultravox_signature_is_accepted() {
        assert_eq!(ultravox(&sign(NOW, BODY), NOW, BODY), Ok(()));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let sig = sign(NOW, BODY);
        let tampered = br#"{"event":"call.started","call_id":"uv_2"}"#;
        assert_eq!(ultravox(&sig, NOW, tampered), Err(SignatureError::Mismatch));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let sig = sign_webhook("other", NOW, std::str::from_utf8(BODY).unwrap());
        assert_eq!(ultravox(&sig, NOW, BODY), Err(SignatureError::Mismatch));
    }

    #[test]
    fn freshness_window_edges() {
        let ts = NOW - 299;
        assert_eq!(ultravox(&sign(ts, BODY), ts, BODY), Ok(()));

        let ts = NOW - 300;
        assert_eq!(ultravox(&sign(ts, BODY), ts, BODY), Ok(()));

        let ts = NOW - 301;
        assert_eq!(ultravox(&sign(ts, BODY), ts, BODY), Err(SignatureError::Stale));

        let ts = NOW + 61;
        assert_eq!(
            ultravox(&sign(ts, BODY), ts, BODY),
            Err(SignatureError::FromFuture)
        );
    }

    #[test]
    fn missing_secret_fails_closed() {
        let sig = sign(NOW, BODY);
        let ts = NOW.to_string();
        assert_eq!(
            verify_ultravox(None, Some(&sig), Some(&ts), BODY, 300, NOW),
            Err(SignatureError::MissingSecret)
        );
        assert_eq!(
            verify_ultravox(Some(""), Some(&sig), Some(&ts), BODY, 300, NOW),
            Err(SignatureError::MissingSecret)
        );
    }

    #[test]
    fn missing_headers_are_reported() {
        assert_eq!(
            verify_ultravox(Some(SECRET), None, Some("1"), BODY, 300, NOW),
            Err(SignatureError::MissingHeader(ULTRAVOX_SIGNATURE_HEADER))
        );
        assert_eq!(
            verify_ultravox(Some(SECRET), Some("ab"), Some("yesterday"), BODY, 300, NOW),
            Err(SignatureError::MalformedHeader(ULTRAVOX_TIMESTAMP_HEADER))
        );
    }

    #[test]
    fn stripe_accepts_any_v1_and_ignores_v0() {
        let good = sign(NOW, BODY);
        let header = format!("t={NOW},v1=deadbeef,v1={good},v0={good}");
        assert_eq!(verify_stripe(Some(SECRET), Some(&header), BODY, 300, NOW), Ok(()));

        let header = format!("t={NOW},v0={good}");
        assert_eq!(
            verify_stripe(Some(SECRET), Some(&header), BODY, 300, NOW),
            Err(SignatureError::MalformedHeader(STRIPE_SIGNATURE_HEADER))
        );
    }

    #[test]
    fn stripe_header_parsing() {
        let (ts, sigs) = parse_stripe_header("t=42, v1=aa ,v1=bb,foo").unwrap();
        assert_eq!(ts, 42);
        assert_eq!(sigs, vec!["aa", "bb"]);
        assert!(parse_stripe_header("v1=aa").is_err());
        assert!(parse_stripe_header("t=x,v1=aa").is_err());
    }

    #[test]
    fn stale_stripe_event_is_rejected() {
        let ts = NOW - 301;
        let header = format!("t={ts},v1={}", sign(ts, BODY));
        assert_eq!(
            verify_stripe(Some(SECRET), Some(&header), BODY, 300, NOW),
            Err(SignatureError::Stale)
        );
    }
}
