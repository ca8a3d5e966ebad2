//! Call records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, CallId, CampaignId, TenantId};

str_enum! {
    /// Which side placed the call.
    pub enum CallDirection("call direction") {
        /// The caller dialled one of the tenant's numbers.
        Inbound => "inbound",
        /// The agent dials out.
        Outbound => "outbound",
    }
}

str_enum! {
    /// Call lifecycle status.
    pub enum CallStatus("call status") {
        /// Created locally, waiting on the provider.
        Queued => "queued",
        /// The provider is dialling.
        Ringing => "ringing",
        /// Conversation in progress.
        InProgress => "in_progress",
        /// Ended normally and billed.
        Completed => "completed",
        /// Ended with an error.
        Failed => "failed",
    }
}

impl CallStatus {
    /// `completed` and `failed` are terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a call in this status may move to `next`.
    ///
    /// Terminal statuses never move back to a non-terminal one; reapplying the
    /// same terminal status is allowed so webhook replays stay no-ops.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return next.is_terminal();
        }
        true
    }
}

/// A call owned by a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Local call ID.
    pub id: CallId,

    /// Owning tenant.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,

    /// Agent handling the call.
    pub agent_id: AgentId,

    /// Provider correlation ID, set once the provider accepted the call.
    pub ultravox_call_id: Option<String>,

    /// E.164 phone number of the other party.
    pub phone_number: String,

    /// Inbound or outbound.
    pub direction: CallDirection,

    /// Lifecycle status.
    pub status: CallStatus,

    /// Free-form context passed to the provider (may carry `campaign_id`).
    #[serde(default)]
    pub context: serde_json::Value,

    /// Recording/transcription settings passed to the provider.
    #[serde(default)]
    pub call_settings: serde_json::Value,

    /// When the conversation started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the call ended.
    pub ended_at: Option<DateTime<Utc>>,

    /// Duration reported by the provider.
    pub duration_seconds: Option<i64>,

    /// Cost reported by the provider.
    pub cost_usd: Option<f64>,

    /// Recording URL reported by the provider.
    pub recording_url: Option<String>,

    /// Error message for failed calls.
    pub error_message: Option<String>,

    /// When the call was created.
    pub created_at: DateTime<Utc>,

    /// When the call was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Call {
    /// Create a queued call.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        agent_id: AgentId,
        phone_number: impl Into<String>,
        direction: CallDirection,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CallId::generate(),
            tenant_id,
            agent_id,
            ultravox_call_id: None,
            phone_number: phone_number.into(),
            direction,
            status: CallStatus::Queued,
            context: serde_json::Value::Object(serde_json::Map::new()),
            call_settings: serde_json::Value::Object(serde_json::Map::new()),
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            cost_usd: None,
            recording_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Campaign this call was placed for, if its context names one.
    #[must_use]
    pub fn campaign_id(&self) -> Option<CampaignId> {
        self.context
            .get("campaign_id")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Returns `false` (leaving the call untouched) when the move would
    /// regress a terminal call.
    pub fn transition(&mut self, next: CallStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_calls_do_not_regress() {
        let mut call = Call::new(
            TenantId::generate(),
            AgentId::generate(),
            "+15551234567",
            CallDirection::Outbound,
        );
        assert!(call.transition(CallStatus::InProgress));
        assert!(call.transition(CallStatus::Completed));
        assert!(!call.transition(CallStatus::InProgress));
        assert_eq!(call.status, CallStatus::Completed);
        assert!(call.transition(CallStatus::Completed));
    }

    #[test]
    fn campaign_id_is_read_from_context() {
        let campaign = CampaignId::generate();
        let mut call = Call::new(
            TenantId::generate(),
            AgentId::generate(),
            "+15551234567",
            CallDirection::Outbound,
        );
        assert_eq!(call.campaign_id(), None);
        call.context = serde_json::json!({ "campaign_id": campaign.to_string() });
        assert_eq!(call.campaign_id(), Some(campaign));
    }

    #[test]
    fn status_strings_match_the_wire() {
        assert_eq!(CallStatus::InProgress.as_str(), "in_progress");
        assert_eq!("completed".parse::<CallStatus>().unwrap(), CallStatus::Completed);
        assert_eq!(
            serde_json::to_value(CallDirection::Outbound).unwrap(),
            serde_json::json!("outbound")
        );
    }
}
