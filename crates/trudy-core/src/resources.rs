//! Provider-backed resources: agents, voices, knowledge bases and tools.
//!
//! Each record is created locally first, then mirrored to Ultravox; the
//! provider's ID is stored once the outward call succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, KnowledgeBaseId, TenantId, ToolId, VoiceId};

str_enum! {
    /// Agent status.
    pub enum AgentStatus("agent status") {
        /// Local record written, provider call pending.
        Creating => "creating",
        /// Usable for calls.
        Active => "active",
        /// Provider creation failed.
        Failed => "failed",
    }
}

str_enum! {
    /// Tool status.
    pub enum ToolStatus("tool status") {
        /// Local record written, provider call pending.
        Creating => "creating",
        /// Registered with the provider.
        Active => "active",
        /// Provider creation failed.
        Failed => "failed",
    }
}

str_enum! {
    /// Knowledge base status.
    pub enum KnowledgeBaseStatus("knowledge base status") {
        /// Local record written, corpus creation pending.
        Creating => "creating",
        /// Corpus exists and can be attached to agents.
        Ready => "ready",
        /// Corpus creation failed.
        Failed => "failed",
    }
}

str_enum! {
    /// Voice status.
    pub enum VoiceStatus("voice status") {
        /// Native clone is training.
        Training => "training",
        /// Usable by agents.
        Active => "active",
        /// Training or registration failed.
        Failed => "failed",
    }
}

str_enum! {
    /// How a voice is obtained.
    pub enum VoiceStrategy("voice strategy") {
        /// Pick based on the source.
        Auto => "auto",
        /// Train a clone from samples; costs credits.
        Native => "native",
        /// Reference an existing provider voice.
        External => "external",
    }
}

impl VoiceStrategy {
    /// Whether this strategy trains (and bills) a native clone.
    #[must_use]
    pub const fn trains(self) -> bool {
        matches!(self, Self::Native)
    }
}

/// A voice agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Agent ID.
    pub id: AgentId,
    /// Owning tenant.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,
    /// Provider correlation ID.
    pub ultravox_agent_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Voice the agent speaks with.
    pub voice_id: VoiceId,
    /// System prompt.
    pub system_prompt: String,
    /// Model name.
    pub model: String,
    /// Tool attachments as sent by the client.
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    /// Attached knowledge bases.
    #[serde(default)]
    pub knowledge_bases: Vec<KnowledgeBaseId>,
    /// Status.
    pub status: AgentStatus,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Updated.
    pub updated_at: DateTime<Utc>,
}

/// A voice, either a trained clone or a provider reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    /// Voice ID.
    pub id: VoiceId,
    /// Owning tenant.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,
    /// Display name.
    pub name: String,
    /// TTS provider name.
    pub provider: String,
    /// `custom` for native clones, `reference` otherwise.
    #[serde(rename = "type")]
    pub voice_type: String,
    /// Language tag.
    pub language: String,
    /// Status.
    pub status: VoiceStatus,
    /// Training progress, timestamps and errors.
    #[serde(default)]
    pub training_info: serde_json::Value,
    /// Provider correlation ID.
    pub ultravox_voice_id: Option<String>,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Updated.
    pub updated_at: DateTime<Utc>,
}

impl Voice {
    /// Mark training finished.
    ///
    /// Reapplying to an already active voice only refreshes the timestamps.
    pub fn complete_training(&mut self, at: DateTime<Utc>) {
        self.status = VoiceStatus::Active;
        let mut info = self.training_info.as_object().cloned().unwrap_or_default();
        info.insert("progress".into(), serde_json::json!(100));
        info.insert("completed_at".into(), serde_json::json!(at.to_rfc3339()));
        self.training_info = serde_json::Value::Object(info);
        self.updated_at = at;
    }

    /// Mark training failed with `error`.
    pub fn fail_training(&mut self, error: &str, at: DateTime<Utc>) {
        self.status = VoiceStatus::Failed;
        let mut info = self.training_info.as_object().cloned().unwrap_or_default();
        info.insert("error_message".into(), serde_json::json!(error));
        info.insert("failed_at".into(), serde_json::json!(at.to_rfc3339()));
        self.training_info = serde_json::Value::Object(info);
        self.updated_at = at;
    }
}

/// A knowledge base backed by a provider corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    /// Knowledge base ID.
    pub id: KnowledgeBaseId,
    /// Owning tenant.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Language tag.
    pub language: String,
    /// Provider corpus ID.
    pub ultravox_corpus_id: Option<String>,
    /// Status.
    pub status: KnowledgeBaseStatus,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Updated.
    pub updated_at: DateTime<Utc>,
}

/// An HTTP tool agents may call during a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool ID.
    pub id: ToolId,
    /// Owning tenant.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,
    /// Provider correlation ID.
    pub ultravox_tool_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Free-form category.
    pub category: Option<String>,
    /// HTTPS endpoint the tool calls.
    pub endpoint: String,
    /// HTTP method.
    pub method: String,
    /// Authentication settings.
    #[serde(default)]
    pub authentication: serde_json::Value,
    /// Parameter schema.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Response schema.
    #[serde(default)]
    pub response_schema: serde_json::Value,
    /// Status.
    pub status: ToolStatus,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Updated.
    pub updated_at: DateTime<Utc>,
}
