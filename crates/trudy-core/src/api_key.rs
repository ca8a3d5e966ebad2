//! Tenant-owned third-party API keys (TTS providers and similar).
//!
//! The key material is stored sealed and never serialized back to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ApiKeyId, TenantId};

/// A stored API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Key ID.
    pub id: ApiKeyId,
    /// Owning tenant.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,
    /// Service the key is for, e.g. `elevenlabs`.
    pub service: String,
    /// Display name, unique per tenant and service.
    pub key_name: String,
    /// Sealed key material (plaintext when `encrypted` is false).
    #[serde(skip_serializing)]
    pub encrypted_key: String,
    /// Whether `encrypted_key` is ciphertext.
    pub encrypted: bool,
    /// Provider-specific settings.
    pub settings: serde_json::Value,
    /// Inactive keys are kept but not used.
    pub is_active: bool,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Updated.
    pub updated_at: DateTime<Utc>,
}

str_enum! {
    /// External text-to-speech providers a tenant can bring a key for.
    pub enum TtsProvider("TTS provider") {
        /// Google Cloud TTS.
        Google => "google",
        /// Amazon Polly.
        Aws => "aws",
        /// Azure Speech.
        Azure => "azure",
        /// OpenAI TTS.
        OpenAi => "openai",
        /// ElevenLabs.
        ElevenLabs => "elevenlabs",
    }
}

impl TtsProvider {
    /// Name given to the key stored for this provider.
    #[must_use]
    pub fn key_name(self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        let title: String = chars
            .next()
            .map(|first| first.to_uppercase().chain(chars).collect())
            .unwrap_or_default();
        format!("{title} TTS Key")
    }
}
