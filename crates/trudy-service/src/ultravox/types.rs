//! Ultravox API request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response to any create call; Ultravox answers with the new resource's ID.
#[derive(Debug, Clone, Deserialize)]
pub struct Created {
    /// Provider ID of the created resource.
    #[serde(default)]
    pub id: Option<String>,
}

/// Request body for `POST /calls`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateCallRequest {
    /// Provider agent ID.
    pub agent_id: Option<String>,
    /// E.164 number to dial or that dialed in.
    pub phone_number: String,
    /// `inbound` or `outbound`.
    pub direction: String,
    /// Provider call settings.
    pub call_settings: Value,
    /// Opaque context echoed back in call webhooks.
    pub context: Value,
}

/// Voice selection for an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentVoice {
    /// TTS provider.
    pub provider: String,
    /// Provider voice ID.
    pub voice_id: Option<String>,
}

/// Knowledge base binding for an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentKnowledgeBase {
    /// Provider corpus IDs.
    pub corpus_ids: Vec<String>,
    /// Whether retrieval is enabled.
    pub search_enabled: bool,
    /// Retrieved chunks per turn.
    pub context_window: u32,
}

/// Request body for `POST /agents`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateAgentRequest {
    /// Agent name.
    pub name: String,
    /// Voice used by the agent.
    pub voice: AgentVoice,
    /// System prompt.
    pub system_prompt: String,
    /// Model name.
    pub model: String,
    /// Conversation settings.
    pub settings: Value,
    /// Bound corpora; omitted when the agent has none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_base: Option<AgentKnowledgeBase>,
    /// Tool definitions.
    pub tools: Vec<Value>,
}

/// Request body for `POST /corpora`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateCorpusRequest {
    /// Corpus name.
    pub name: String,
    /// Corpus description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Content language.
    pub language: String,
}

/// Request body for `POST /tools` and `PATCH /tools/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// What the tool does, shown to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// HTTP endpoint the tool calls.
    pub endpoint: String,
    /// HTTP method.
    pub method: String,
    /// Authentication settings.
    pub authentication: Value,
    /// Parameter schema.
    pub parameters: Value,
    /// Response schema.
    pub response_schema: Value,
}

/// Training sample for a native voice clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSample {
    /// Where the provider can fetch the audio.
    pub audio_url: String,
    /// Sample length in seconds.
    pub duration_seconds: f64,
}

/// Request body for `POST /voices`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateVoiceRequest {
    /// Voice name.
    pub name: String,
    /// TTS provider.
    pub provider: String,
    /// Language tag.
    pub language: String,
    /// `custom` for native clones, `reference` for imported voices.
    #[serde(rename = "type")]
    pub voice_type: String,
    /// Training samples (native clones only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<VoiceSample>,
    /// Existing provider voice to reference (imports only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_voice_id: Option<String>,
}

/// One contact in a scheduled batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchContact {
    /// Number to dial.
    pub phone_number: String,
    /// Context echoed back in call webhooks; carries `campaign_id`.
    pub context: Value,
}

/// When a batch runs.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSchedule {
    /// Start time; `None` runs immediately.
    pub at: Option<String>,
    /// Timezone for the schedule.
    pub timezone: String,
}

/// Batch execution settings.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSettings {
    /// Concurrent call limit.
    pub max_concurrent: u32,
    /// Whether calls are recorded.
    pub recording_enabled: bool,
}

/// A scheduled batch of outbound calls.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    /// Contacts to dial.
    pub contacts: Vec<BatchContact>,
    /// Telephony medium.
    pub medium: Value,
    /// Schedule.
    pub schedule: BatchSchedule,
    /// Settings.
    pub settings: BatchSettings,
}

/// Request body for `POST /agents/{id}/scheduled-batches`.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledBatchRequest {
    /// Batches to create.
    pub batches: Vec<Batch>,
}

/// Response to a scheduled-batch creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduledBatchResponse {
    /// Created batches.
    #[serde(default)]
    pub batches: Vec<BatchRef>,
}

/// Reference to a created batch.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRef {
    /// Provider batch ID.
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl ScheduledBatchResponse {
    /// IDs of the created batches, skipping entries without one.
    #[must_use]
    pub fn batch_ids(&self) -> Vec<String> {
        self.batches
            .iter()
            .filter_map(|b| b.batch_id.clone())
            .collect()
    }
}
