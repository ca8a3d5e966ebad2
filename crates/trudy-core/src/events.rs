//! Domain events published after state changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventEnvelope, TenantId};

str_enum! {
    /// Every event type the backend emits.
    pub enum EventType("event type") {
        /// An outbound or inbound call was created.
        CallCreated => "call.created",
        /// The provider reported the conversation started.
        CallStarted => "call.started",
        /// The call ended and was billed.
        CallCompleted => "call.completed",
        /// The call failed.
        CallFailed => "call.failed",
        /// A native voice finished training.
        VoiceTrainingCompleted => "voice.training.completed",
        /// A native voice failed to train.
        VoiceTrainingFailed => "voice.training.failed",
        /// An agent was created.
        AgentCreated => "agent.created",
        /// A campaign was created.
        CampaignCreated => "campaign.created",
        /// A campaign was handed to the provider.
        CampaignScheduled => "campaign.scheduled",
        /// A knowledge base was created.
        KnowledgeBaseCreated => "knowledge_base.created",
        /// A payment added credits.
        CreditsPurchased => "credits.purchased",
    }
}

/// Something that happened to a tenant's records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Event type.
    pub event_type: EventType,
    /// Tenant the event belongs to.
    pub tenant_id: TenantId,
    /// Event payload.
    pub data: serde_json::Value,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    /// An event happening now.
    #[must_use]
    pub fn new(event_type: EventType, tenant_id: TenantId, data: serde_json::Value) -> Self {
        Self {
            event_type,
            tenant_id,
            data,
            occurred_at: Utc::now(),
        }
    }

    /// The envelope subscribers receive for this event.
    #[must_use]
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event: self.event_type.as_str().to_string(),
            data: self.data.clone(),
            timestamp: self.occurred_at,
        }
    }
}
