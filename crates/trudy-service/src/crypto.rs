//! HMAC signing shared by webhook ingress and egress.
//!
//! Every webhook in this service, inbound or outbound, is signed the same way:
//! HMAC-SHA256 over `"{timestamp}.{body}"`, hex encoded.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 over `message` and return it hex encoded.
///
/// # Panics
///
/// Never in practice: HMAC-SHA256 accepts keys of any size per RFC 2104.
#[must_use]
pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    // INVARIANT: HMAC accepts keys of any length, so `new_from_slice` cannot fail.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC-SHA256 accepts any key size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Signature for a webhook body sent or received at `timestamp`.
#[must_use]
pub fn sign_webhook(secret: &str, timestamp: i64, body: &str) -> String {
    hmac_sha256_hex(secret, &format!("{timestamp}.{body}"))
}

/// Constant-time string comparison.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// A random secret of `bytes` bytes, hex encoded.
#[must_use]
pub fn generate_secret(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sha256_produces_correct_length() {
        let result = hmac_sha256_hex("key", "The quick brown fox jumps over the lazy dog");
        assert_eq!(result.len(), 64);
        assert_eq!(
            result,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn webhook_signature_covers_timestamp() {
        let a = sign_webhook("secret", 1_700_000_000, "{}");
        let b = sign_webhook("secret", 1_700_000_001, "{}");
        assert_ne!(a, b);
        assert_eq!(a, hmac_sha256_hex("secret", "1700000000.{}"));
    }

    #[test]
    fn constant_time_eq_behaves_like_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
        assert!(!constant_time_eq("abc", "ABC"));
    }

    #[test]
    fn generated_secrets_are_hex_and_distinct() {
        let a = generate_secret(16);
        let b = generate_secret(16);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
