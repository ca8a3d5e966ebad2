//! Sealing tenant API keys at rest.
//!
//! Keys are sealed with AES-256-GCM under the master key from
//! `API_KEY_ENCRYPTION_KEY` (32 bytes, base64). The stored form is
//! `base64(nonce || ciphertext)` with a fresh 12-byte nonce per key.
//!
//! Without a usable master key the cipher is unavailable. Fail-open (the
//! default) then stores keys as plaintext, flagged `encrypted = false`;
//! fail-closed refuses to store them.

use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::ServiceConfig;

/// Length of the master key in bytes.
pub const MASTER_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

/// Sealing failure.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The master key or a sealed value is not valid base64.
    #[error("invalid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The master key has the wrong length.
    #[error("master key must be {MASTER_KEY_LEN} bytes, got {0}")]
    KeyLength(usize),

    /// No master key is configured and plaintext storage is not allowed.
    #[error("API key encryption is unavailable")]
    Unavailable,

    /// A sealed value failed authentication or is truncated.
    #[error("sealed value is corrupt")]
    Corrupt,
}

/// A key ready to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Stored text.
    pub value: String,
    /// Whether `value` is ciphertext.
    pub encrypted: bool,
}

/// Seals and opens tenant API keys.
pub struct KeyCipher {
    cipher: Option<Aes256Gcm>,
    fail_open: bool,
}

impl fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCipher")
            .field("available", &self.is_available())
            .field("fail_open", &self.fail_open)
            .finish()
    }
}

impl KeyCipher {
    /// A cipher using the base64 `master_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not base64 or not 32 bytes.
    pub fn new(master_key: &str, fail_open: bool) -> Result<Self, SecretError> {
        let key = BASE64.decode(master_key.trim().as_bytes())?;
        if key.len() != MASTER_KEY_LEN {
            return Err(SecretError::KeyLength(key.len()));
        }
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|_| SecretError::KeyLength(key.len()))?;
        Ok(Self {
            cipher: Some(cipher),
            fail_open,
        })
    }

    /// A cipher with no master key.
    #[must_use]
    pub const fn unavailable(fail_open: bool) -> Self {
        Self {
            cipher: None,
            fail_open,
        }
    }

    /// Build from configuration. A bad master key leaves the cipher
    /// unavailable rather than stopping the service.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        let fail_open = config.api_key_encryption_fail_open;
        match config.api_key_encryption_key.as_deref() {
            Some(key) => Self::new(key, fail_open).unwrap_or_else(|e| {
                tracing::error!(error = %e, "API_KEY_ENCRYPTION_KEY unusable - encryption disabled");
                Self::unavailable(fail_open)
            }),
            None => {
                if fail_open {
                    tracing::warn!(
                        "API_KEY_ENCRYPTION_KEY not configured - API keys will be stored as plaintext"
                    );
                } else {
                    tracing::warn!(
                        "API_KEY_ENCRYPTION_KEY not configured - API key storage is disabled"
                    );
                }
                Self::unavailable(fail_open)
            }
        }
    }

    /// Whether a master key is loaded.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal `plaintext` for storage.
    ///
    /// # Errors
    ///
    /// Returns `SecretError::Unavailable` when there is no master key and
    /// plaintext storage is not allowed.
    pub fn seal(&self, plaintext: &str) -> Result<Sealed, SecretError> {
        let Some(cipher) = &self.cipher else {
            if self.fail_open {
                tracing::warn!("Storing API key as plaintext");
                return Ok(Sealed {
                    value: plaintext.to_string(),
                    encrypted: false,
                });
            }
            return Err(SecretError::Unavailable);
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| SecretError::Corrupt)?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(Sealed {
            value: BASE64.encode(sealed),
            encrypted: true,
        })
    }

    /// Recover the plaintext of a stored key.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is ciphertext and there is no master key,
    /// or if it fails to decode or authenticate.
    pub fn open(&self, stored: &str, encrypted: bool) -> Result<String, SecretError> {
        if !encrypted {
            return Ok(stored.to_string());
        }
        let cipher = self.cipher.as_ref().ok_or(SecretError::Unavailable)?;
        let raw = BASE64.decode(stored.as_bytes())?;
        if raw.len() <= NONCE_LEN {
            return Err(SecretError::Corrupt);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Corrupt)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::Corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_key() -> String {
        BASE64.encode([7u8; MASTER_KEY_LEN])
    }

    #[test]
    fn sealed_keys_open_with_the_same_master_key() {
        let cipher = KeyCipher::new(&master_key(), false).unwrap();
        let sealed = cipher.seal("sk_live_tts").unwrap();
        assert!(sealed.encrypted);
        assert!(!sealed.value.contains("sk_live_tts"));
        assert_eq!(cipher.open(&sealed.value, true).unwrap(), "sk_live_tts");

        // Fresh nonce per seal.
        assert_ne!(cipher.seal("sk_live_tts").unwrap().value, sealed.value);
    }

    #[test]
    fn tampered_values_are_rejected() {
        let cipher = KeyCipher::new(&master_key(), false).unwrap();
        let sealed = cipher.seal("sk_live_tts").unwrap();
        let mut raw = BASE64.decode(&sealed.value).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        assert!(matches!(
            cipher.open(&BASE64.encode(raw), true),
            Err(SecretError::Corrupt)
        ));
        assert!(matches!(
            cipher.open(&BASE64.encode([0u8; 4]), true),
            Err(SecretError::Corrupt)
        ));

        let other = KeyCipher::new(&BASE64.encode([9u8; MASTER_KEY_LEN]), false).unwrap();
        assert!(other.open(&sealed.value, true).is_err());
    }

    #[test]
    fn master_key_must_be_32_bytes_of_base64() {
        assert!(matches!(
            KeyCipher::new(&BASE64.encode([1u8; 16]), true),
            Err(SecretError::KeyLength(16))
        ));
        assert!(matches!(
            KeyCipher::new("not base64!", true),
            Err(SecretError::Decode(_))
        ));
    }

    #[test]
    fn missing_master_key_follows_the_fail_open_policy() {
        let open = KeyCipher::unavailable(true);
        assert_eq!(
            open.seal("sk_plain").unwrap(),
            Sealed {
                value: "sk_plain".into(),
                encrypted: false
            }
        );
        assert_eq!(open.open("sk_plain", false).unwrap(), "sk_plain");

        let closed = KeyCipher::unavailable(false);
        assert!(matches!(closed.seal("sk_plain"), Err(SecretError::Unavailable)));
        assert!(matches!(closed.open("abc", true), Err(SecretError::Unavailable)));
    }

    #[test]
    fn unusable_configured_key_disables_encryption() {
        let config = ServiceConfig {
            api_key_encryption_key: Some("too-short".into()),
            api_key_encryption_fail_open: false,
            ..ServiceConfig::default()
        };
        let cipher = KeyCipher::from_config(&config);
        assert!(!cipher.is_available());
        assert!(cipher.seal("sk").is_err());
    }
}
