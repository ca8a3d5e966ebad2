//! Campaign handlers.
//!
//! A campaign is edited and loaded with contacts while in `draft`, then
//! handed to Ultravox as a scheduled batch. Stats are always recomputed from
//! the contact rows.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use trudy_core::{
    is_e164, AgentId, AgentStatus, AuditAction, Campaign, CampaignContact, CampaignId, CampaignStats,
    CampaignStatus, ContactStatus, DomainEvent, EventType, NewContact, ScheduleType, TenantId,
};
use trudy_store::CampaignFilter;

use super::{check_len, created, ok, paged, Deleted, Envelope, ListEnvelope, PageQuery};
use crate::audit;
use crate::auth::{AuthUser, Manage, Require};
use crate::error::ApiError;
use crate::state::AppState;
use crate::ultravox::{
    Batch, BatchContact, BatchSchedule, BatchSettings, ScheduledBatchRequest,
};

const MAX_CONCURRENT_CALLS: u32 = 100;
const DEFAULT_MAX_CONCURRENT_CALLS: u32 = 10;

/// Create campaign request.
#[derive(Debug, Deserialize)]
pub struct CreateCampaignBody {
    /// Campaign name.
    pub name: String,
    /// Agent placing the calls.
    pub agent_id: AgentId,
    /// Run now or at `scheduled_at`.
    pub schedule_type: ScheduleType,
    /// Start time for scheduled campaigns.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Timezone for the schedule.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Concurrent call limit (1-100).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_calls: u32,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_max_concurrent() -> u32 {
    DEFAULT_MAX_CONCURRENT_CALLS
}

/// Update campaign request; only draft campaigns can change.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateCampaignBody {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New agent.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    /// New schedule type.
    #[serde(default)]
    pub schedule_type: Option<ScheduleType>,
    /// New start time.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// New timezone.
    #[serde(default)]
    pub timezone: Option<String>,
    /// New concurrency limit.
    #[serde(default)]
    pub max_concurrent_calls: Option<u32>,
}

/// Contact upload request.
#[derive(Debug, Deserialize)]
pub struct UploadContactsBody {
    /// Contacts to add.
    pub contacts: Vec<NewContact>,
}

/// Contact upload result.
#[derive(Debug, Serialize)]
pub struct UploadContactsResponse {
    /// Campaign the contacts were added to.
    pub campaign_id: CampaignId,
    /// Contacts inserted.
    pub contacts_added: usize,
    /// Contacts skipped as duplicates.
    pub contacts_failed: usize,
    /// Stats after the upload.
    pub stats: CampaignStats,
}

/// Campaign list filters.
#[derive(Debug, Deserialize)]
pub struct ListCampaignsQuery {
    /// Only campaigns using this agent.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    /// Only campaigns in this status.
    #[serde(default)]
    pub status: Option<CampaignStatus>,
    /// Page size.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Rows to skip.
    #[serde(default)]
    pub offset: Option<usize>,
}

fn check_max_concurrent(value: u32) -> Result<(), ApiError> {
    if (1..=MAX_CONCURRENT_CALLS).contains(&value) {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "max_concurrent_calls must be 1-{MAX_CONCURRENT_CALLS}"
        )))
    }
}

async fn require_active_agent(
    state: &AppState,
    tenant_id: TenantId,
    agent_id: AgentId,
) -> Result<trudy_core::Agent, ApiError> {
    let agent = state
        .store
        .get_agent(tenant_id, agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Agent"))?;
    if agent.status != AgentStatus::Active {
        return Err(ApiError::Validation("Agent must be active".into()));
    }
    Ok(agent)
}

async fn load(
    state: &AppState,
    tenant_id: TenantId,
    campaign_id: CampaignId,
) -> Result<Campaign, ApiError> {
    state
        .store
        .get_campaign(tenant_id, campaign_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Campaign"))
}

fn require_draft(campaign: &Campaign, action: &str) -> Result<(), ApiError> {
    if campaign.status == CampaignStatus::Draft {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "Campaign can only be {action} in draft status (status: {})",
            campaign.status
        )))
    }
}

/// Create a draft campaign.
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Json(body): Json<CreateCampaignBody>,
) -> Result<(StatusCode, Json<Envelope<Campaign>>), ApiError> {
    check_len("name", &body.name, 1, 100)?;
    check_max_concurrent(body.max_concurrent_calls)?;
    if body.schedule_type == ScheduleType::Scheduled && body.scheduled_at.is_none() {
        return Err(ApiError::Validation(
            "scheduled_at is required for scheduled campaigns".into(),
        ));
    }
    let agent = require_active_agent(&state, auth.tenant_id, body.agent_id).await?;

    let now = Utc::now();
    let campaign = Campaign {
        id: CampaignId::generate(),
        tenant_id: auth.tenant_id,
        agent_id: agent.id,
        name: body.name,
        schedule_type: body.schedule_type,
        scheduled_at: body.scheduled_at,
        timezone: body.timezone,
        max_concurrent_calls: body.max_concurrent_calls,
        status: CampaignStatus::Draft,
        ultravox_batch_ids: Vec::new(),
        stats: CampaignStats::default(),
        created_at: now,
        updated_at: now,
    };
    state.store.insert_campaign(&campaign).await?;

    tracing::info!(campaign_id = %campaign.id, tenant_id = %campaign.tenant_id, "Campaign created");
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Insert, "campaigns", campaign.id),
    )
    .await;
    state
        .publish(DomainEvent::new(
            EventType::CampaignCreated,
            campaign.tenant_id,
            json!({
                "campaign_id": campaign.id,
                "agent_id": campaign.agent_id,
                "name": campaign.name,
            }),
        ))
        .await;

    Ok(created(campaign))
}

/// List campaigns, newest first.
pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListCampaignsQuery>,
) -> Result<Json<ListEnvelope<Campaign>>, ApiError> {
    let defaults = PageQuery::default();
    let page = PageQuery {
        limit: query.limit.unwrap_or(defaults.limit),
        offset: query.offset.unwrap_or(defaults.offset),
    }
    .page();
    let filter = CampaignFilter {
        agent_id: query.agent_id,
        status: query.status,
    };

    let campaigns = state
        .store
        .list_campaigns(auth.tenant_id, filter, page)
        .await?;
    Ok(paged(campaigns, page))
}

/// Get one campaign with freshly recomputed stats.
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Json<Envelope<Campaign>>, ApiError> {
    let mut campaign = load(&state, auth.tenant_id, campaign_id).await?;
    if let Some(stats) = state.store.recompute_campaign_stats(campaign.id).await? {
        campaign.stats = stats;
    }
    Ok(ok(campaign))
}

/// Edit a draft campaign.
pub async fn update_campaign(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Path(campaign_id): Path<CampaignId>,
    Json(body): Json<UpdateCampaignBody>,
) -> Result<Json<Envelope<Campaign>>, ApiError> {
    let mut campaign = load(&state, auth.tenant_id, campaign_id).await?;
    require_draft(&campaign, "updated")?;
    let before = campaign.clone();

    if let Some(name) = body.name {
        check_len("name", &name, 1, 100)?;
        campaign.name = name;
    }
    if let Some(agent_id) = body.agent_id {
        campaign.agent_id = require_active_agent(&state, auth.tenant_id, agent_id).await?.id;
    }
    if let Some(schedule_type) = body.schedule_type {
        campaign.schedule_type = schedule_type;
    }
    if let Some(scheduled_at) = body.scheduled_at {
        campaign.scheduled_at = Some(scheduled_at);
    }
    if let Some(timezone) = body.timezone {
        campaign.timezone = timezone;
    }
    if let Some(max) = body.max_concurrent_calls {
        check_max_concurrent(max)?;
        campaign.max_concurrent_calls = max;
    }
    campaign.updated_at = Utc::now();
    state.store.update_campaign(&campaign).await?;
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Update, "campaigns", campaign.id)
            .with_diff(audit::diff(&before, &campaign)),
    )
    .await;

    Ok(ok(campaign))
}

/// Delete a campaign that is not running (draft, failed or completed) and its
/// contacts.
pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Json<Envelope<Deleted<CampaignId>>>, ApiError> {
    let campaign = load(&state, auth.tenant_id, campaign_id).await?;
    if !matches!(
        campaign.status,
        CampaignStatus::Draft | CampaignStatus::Failed | CampaignStatus::Completed
    ) {
        return Err(ApiError::Validation(format!(
            "Campaign can only be deleted in draft, failed or completed status (status: {})",
            campaign.status
        )));
    }

    state.store.delete_campaign(auth.tenant_id, campaign_id).await?;
    tracing::info!(campaign_id = %campaign_id, "Campaign deleted");
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Delete, "campaigns", campaign_id)
            .with_metadata(json!({ "name": campaign.name, "status": campaign.status })),
    )
    .await;

    Ok(ok(Deleted {
        id: campaign_id,
        deleted: true,
    }))
}

/// Add contacts to a draft campaign. Numbers already present are skipped.
pub async fn upload_contacts(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Path(campaign_id): Path<CampaignId>,
    Json(body): Json<UploadContactsBody>,
) -> Result<Json<Envelope<UploadContactsResponse>>, ApiError> {
    let campaign = load(&state, auth.tenant_id, campaign_id).await?;
    require_draft(&campaign, "loaded")?;

    if let Some(bad) = body.contacts.iter().find(|c| !is_e164(&c.phone_number)) {
        return Err(ApiError::Validation(format!(
            "phone_number must be in E.164 format: {}",
            bad.phone_number
        )));
    }

    let submitted = body.contacts.len();
    let contacts: Vec<CampaignContact> = body
        .contacts
        .into_iter()
        .map(|c| c.into_contact(campaign_id))
        .collect();
    let added = state.store.insert_contacts(&contacts).await?;
    let stats = state
        .store
        .recompute_campaign_stats(campaign_id)
        .await?
        .unwrap_or_default();

    tracing::info!(
        campaign_id = %campaign_id,
        added,
        skipped = submitted - added,
        "Campaign contacts uploaded"
    );
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Insert, "campaign_contacts", campaign_id)
            .with_metadata(json!({ "added": added, "skipped": submitted - added })),
    )
    .await;

    Ok(ok(UploadContactsResponse {
        campaign_id,
        contacts_added: added,
        contacts_failed: submitted - added,
        stats,
    }))
}

/// Hand a draft campaign's pending contacts to Ultravox.
pub async fn schedule_campaign(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Json<Envelope<Campaign>>, ApiError> {
    let mut campaign = load(&state, auth.tenant_id, campaign_id).await?;
    require_draft(&campaign, "scheduled")?;

    let pending: Vec<CampaignContact> = state
        .store
        .list_contacts(campaign_id)
        .await?
        .into_iter()
        .filter(|c| c.status == ContactStatus::Pending)
        .collect();
    if pending.is_empty() {
        return Err(ApiError::Validation("No pending contacts found".into()));
    }

    let agent = state
        .store
        .get_agent(auth.tenant_id, campaign.agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Agent"))?;
    let ultravox_agent_id = agent
        .ultravox_agent_id
        .ok_or_else(|| ApiError::Validation("Agent is not provisioned".into()))?;

    let request = ScheduledBatchRequest {
        batches: vec![Batch {
            contacts: pending
                .iter()
                .map(|c| BatchContact {
                    phone_number: c.phone_number.clone(),
                    context: json!({
                        "first_name": c.first_name,
                        "last_name": c.last_name,
                        "campaign_id": campaign_id,
                        "custom_fields": c.custom_fields,
                    }),
                })
                .collect(),
            medium: json!({ "telnyx": {} }),
            schedule: BatchSchedule {
                at: campaign.scheduled_at.map(|at| at.to_rfc3339()),
                timezone: campaign.timezone.clone(),
            },
            settings: BatchSettings {
                max_concurrent: campaign.max_concurrent_calls,
                recording_enabled: true,
            },
        }],
    };

    let response = match state
        .ultravox
        .create_scheduled_batch(&ultravox_agent_id, &request)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(campaign_id = %campaign_id, error = %e, "Scheduling campaign failed");
            campaign.status = CampaignStatus::Failed;
            campaign.updated_at = Utc::now();
            state.store.update_campaign(&campaign).await?;
            return Err(e.into());
        }
    };

    campaign.status = CampaignStatus::Scheduled;
    campaign.ultravox_batch_ids = response.batch_ids();
    campaign.updated_at = Utc::now();
    state.store.update_campaign(&campaign).await?;

    tracing::info!(
        campaign_id = %campaign_id,
        contacts = pending.len(),
        batches = campaign.ultravox_batch_ids.len(),
        "Campaign scheduled"
    );
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Update, "campaigns", campaign.id).with_diff(json!({
            "status": { "before": CampaignStatus::Draft, "after": campaign.status },
        })),
    )
    .await;
    state
        .publish(DomainEvent::new(
            EventType::CampaignScheduled,
            campaign.tenant_id,
            json!({
                "campaign_id": campaign.id,
                "scheduled_at": campaign.scheduled_at,
                "contact_count": pending.len(),
                "batch_ids": campaign.ultravox_batch_ids,
            }),
        ))
        .await;

    Ok(ok(campaign))
}
