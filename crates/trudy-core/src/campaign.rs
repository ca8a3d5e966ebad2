//! Outbound calling campaigns and their contacts.
//!
//! Campaign `stats` is a projection of the contact set. It is recomputed with
//! [`CampaignStats::from_contacts`] whenever contact statuses change and is
//! never edited by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, CallId, CampaignId, ContactId, TenantId};

str_enum! {
    /// Campaign lifecycle status.
    pub enum CampaignStatus("campaign status") {
        /// Editable; contacts can be uploaded.
        Draft => "draft",
        /// Handed to the provider as a scheduled batch.
        Scheduled => "scheduled",
        /// Calls are being placed.
        Active => "active",
        /// All contacts reached a terminal status.
        Completed => "completed",
        /// Scheduling failed.
        Failed => "failed",
    }
}

impl CampaignStatus {
    /// The status a running campaign moves to given fresh contact `stats`,
    /// or `None` if it stays where it is.
    ///
    /// A scheduled campaign becomes active once any contact has been dialled,
    /// and a scheduled or active one completes when no contact is left
    /// pending or calling.
    #[must_use]
    pub fn progressed(self, stats: &CampaignStats) -> Option<Self> {
        if !matches!(self, Self::Scheduled | Self::Active) || stats.total() == 0 {
            return None;
        }
        if stats.pending == 0 && stats.calling == 0 {
            return Some(Self::Completed);
        }
        (self == Self::Scheduled).then_some(Self::Active)
    }
}

str_enum! {
    /// When a campaign starts.
    pub enum ScheduleType("schedule type") {
        /// As soon as it is scheduled.
        Immediate => "immediate",
        /// At `scheduled_at`.
        Scheduled => "scheduled",
    }
}

str_enum! {
    /// Per-contact status within a campaign.
    pub enum ContactStatus("contact status") {
        /// Not yet dialled.
        Pending => "pending",
        /// A call is in flight.
        Calling => "calling",
        /// The call completed.
        Completed => "completed",
        /// The call failed.
        Failed => "failed",
    }
}

/// Contact counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    /// Contacts not yet dialled.
    pub pending: u64,
    /// Contacts currently being called.
    pub calling: u64,
    /// Contacts whose call completed.
    pub completed: u64,
    /// Contacts whose call failed.
    pub failed: u64,
}

impl CampaignStats {
    /// Count contacts by status.
    pub fn from_contacts<'a>(contacts: impl IntoIterator<Item = &'a CampaignContact>) -> Self {
        contacts
            .into_iter()
            .fold(Self::default(), |mut stats, contact| {
                stats.record(contact.status);
                stats
            })
    }

    fn record(&mut self, status: ContactStatus) {
        match status {
            ContactStatus::Pending => self.pending += 1,
            ContactStatus::Calling => self.calling += 1,
            ContactStatus::Completed => self.completed += 1,
            ContactStatus::Failed => self.failed += 1,
        }
    }

    /// Total number of contacts.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending + self.calling + self.completed + self.failed
    }
}

/// A campaign owned by a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    /// Campaign ID.
    pub id: CampaignId,

    /// Owning tenant.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,

    /// Agent placing the calls.
    pub agent_id: AgentId,

    /// Display name.
    pub name: String,

    /// Immediate or scheduled.
    pub schedule_type: ScheduleType,

    /// Start time for scheduled campaigns.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// IANA timezone for the schedule.
    pub timezone: String,

    /// Provider-side concurrency cap.
    pub max_concurrent_calls: u32,

    /// Lifecycle status.
    pub status: CampaignStatus,

    /// Provider batch IDs assigned when scheduled.
    #[serde(default)]
    pub ultravox_batch_ids: Vec<String>,

    /// Contact counts by status.
    pub stats: CampaignStats,

    /// When the campaign was created.
    pub created_at: DateTime<Utc>,

    /// When the campaign was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A phone number to call as part of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContact {
    /// Contact ID.
    pub id: ContactId,

    /// Owning campaign.
    pub campaign_id: CampaignId,

    /// E.164 phone number; unique within the campaign.
    pub phone_number: String,

    /// First name.
    pub first_name: Option<String>,

    /// Last name.
    pub last_name: Option<String>,

    /// Email.
    pub email: Option<String>,

    /// Arbitrary fields forwarded to the agent as call context.
    #[serde(default)]
    pub custom_fields: serde_json::Value,

    /// Dialling status.
    pub status: ContactStatus,

    /// Call placed for this contact, once known.
    pub call_id: Option<CallId>,

    /// When the contact was added.
    pub created_at: DateTime<Utc>,
}

/// Contact fields supplied on upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContact {
    /// E.164 phone number.
    pub phone_number: String,
    /// First name.
    #[serde(default)]
    pub first_name: Option<String>,
    /// Last name.
    #[serde(default)]
    pub last_name: Option<String>,
    /// Email.
    #[serde(default)]
    pub email: Option<String>,
    /// Arbitrary fields.
    #[serde(default)]
    pub custom_fields: Option<serde_json::Value>,
}

impl NewContact {
    /// Turn the upload into a pending contact of `campaign_id`.
    #[must_use]
    pub fn into_contact(self, campaign_id: CampaignId) -> CampaignContact {
        CampaignContact {
            id: ContactId::generate(),
            campaign_id,
            phone_number: self.phone_number,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            custom_fields: self
                .custom_fields
                .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
            status: ContactStatus::Pending,
            call_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Whether `number` looks like an E.164 phone number (`+` then 2-15 digits,
/// no leading zero).
#[must_use]
pub fn is_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (2..=15).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(campaign_id: CampaignId, phone: &str, status: ContactStatus) -> CampaignContact {
        let mut c = NewContact {
            phone_number: phone.to_string(),
            first_name: None,
            last_name: None,
            email: None,
            custom_fields: None,
        }
        .into_contact(campaign_id);
        c.status = status;
        c
    }

    #[test]
    fn stats_count_each_status() {
        let campaign = CampaignId::generate();
        let contacts = vec![
            contact(campaign, "+15550000001", ContactStatus::Pending),
            contact(campaign, "+15550000002", ContactStatus::Pending),
            contact(campaign, "+15550000003", ContactStatus::Calling),
            contact(campaign, "+15550000004", ContactStatus::Completed),
            contact(campaign, "+15550000005", ContactStatus::Failed),
            contact(campaign, "+15550000006", ContactStatus::Completed),
        ];
        let stats = CampaignStats::from_contacts(&contacts);
        assert_eq!(
            stats,
            CampaignStats {
                pending: 2,
                calling: 1,
                completed: 2,
                failed: 1,
            }
        );
        assert_eq!(stats.total(), contacts.len() as u64);
    }

    #[test]
    fn empty_campaign_has_zero_stats() {
        let stats = CampaignStats::from_contacts(std::iter::empty());
        assert_eq!(stats, CampaignStats::default());
        assert_eq!(
            serde_json::to_value(stats).unwrap(),
            serde_json::json!({"pending": 0, "calling": 0, "completed": 0, "failed": 0})
        );
    }

    #[test]
    fn running_campaigns_progress_with_their_contacts() {
        let stats = |pending, calling, completed, failed| CampaignStats {
            pending,
            calling,
            completed,
            failed,
        };
        let untouched = stats(3, 0, 0, 0);
        let dialling = stats(2, 1, 0, 0);
        let settled = stats(0, 0, 2, 1);

        assert_eq!(CampaignStatus::Scheduled.progressed(&untouched), None);
        assert_eq!(
            CampaignStatus::Scheduled.progressed(&dialling),
            Some(CampaignStatus::Active)
        );
        assert_eq!(CampaignStatus::Active.progressed(&dialling), None);
        assert_eq!(
            CampaignStatus::Active.progressed(&settled),
            Some(CampaignStatus::Completed)
        );
        assert_eq!(
            CampaignStatus::Scheduled.progressed(&settled),
            Some(CampaignStatus::Completed)
        );
        assert_eq!(CampaignStatus::Draft.progressed(&settled), None);
        assert_eq!(CampaignStatus::Completed.progressed(&settled), None);
        assert_eq!(
            CampaignStatus::Active.progressed(&CampaignStats::default()),
            None
        );
    }

    #[test]
    fn e164_validation() {
        assert!(is_e164("+15551234567"));
        assert!(is_e164("+44"));
        assert!(!is_e164("15551234567"));
        assert!(!is_e164("+0123"));
        assert!(!is_e164("+1555-123"));
        assert!(!is_e164("+1234567890123456"));
    }
}
