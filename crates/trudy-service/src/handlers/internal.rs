//! Operator endpoints, authenticated with `X-Internal-Key`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use trudy_core::{CampaignId, CampaignStats, DomainEvent, EventType, VoiceId, VoiceStatus};

use crate::auth::InternalAuth;
use crate::error::ApiError;
use crate::state::AppState;
use crate::webhooks::reconciler::refresh_campaign;

/// Idempotency purge result.
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    /// Expired records removed.
    pub deleted_count: u64,
}

/// Delete expired idempotency records.
pub async fn cleanup_idempotency(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
) -> Result<Json<CleanupResponse>, ApiError> {
    let deleted_count = state.store.purge_expired_idempotency(Utc::now()).await?;
    tracing::info!(deleted_count, "Purged expired idempotency records");
    Ok(Json(CleanupResponse { deleted_count }))
}

/// Recomputed campaign counters.
#[derive(Debug, Serialize)]
pub struct CampaignStatsResponse {
    /// Campaign.
    pub campaign_id: CampaignId,
    /// Counters after the recount.
    pub stats: CampaignStats,
}

/// Recount a campaign's contact statuses, advancing the campaign if all
/// contacts have settled.
pub async fn update_campaign_stats(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Json<CampaignStatsResponse>, ApiError> {
    let stats = refresh_campaign(&state, campaign_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Campaign"))?;
    Ok(Json(CampaignStatsResponse { campaign_id, stats }))
}

/// Voice status override.
#[derive(Debug, Default, Deserialize)]
pub struct VoiceStatusBody {
    /// New status.
    #[serde(default)]
    pub status: Option<VoiceStatus>,
    /// Replacement training info.
    #[serde(default)]
    pub training_info: Option<Value>,
    /// Provider correlation ID.
    #[serde(default)]
    pub ultravox_voice_id: Option<String>,
}

/// Voice status after the override.
#[derive(Debug, Serialize)]
pub struct VoiceStatusResponse {
    /// Voice.
    pub voice_id: VoiceId,
    /// Current status.
    pub status: VoiceStatus,
}

/// Set a voice's training state by hand.
pub async fn update_voice_status(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
    Path(voice_id): Path<VoiceId>,
    Json(body): Json<VoiceStatusBody>,
) -> Result<Json<VoiceStatusResponse>, ApiError> {
    let mut voice = state
        .store
        .find_voice(voice_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Voice"))?;

    let previous = voice.status;
    if let Some(status) = body.status {
        voice.status = status;
    }
    if let Some(training_info) = body.training_info {
        voice.training_info = training_info;
    }
    if let Some(ultravox_voice_id) = body.ultravox_voice_id {
        voice.ultravox_voice_id = Some(ultravox_voice_id);
    }
    voice.updated_at = Utc::now();
    state.store.update_voice(&voice).await?;

    tracing::info!(
        voice_id = %voice.id,
        from = %previous,
        to = %voice.status,
        "Voice status updated by operator"
    );

    if previous == VoiceStatus::Training && voice.status != previous {
        let event_type = match voice.status {
            VoiceStatus::Active => Some(EventType::VoiceTrainingCompleted),
            VoiceStatus::Failed => Some(EventType::VoiceTrainingFailed),
            VoiceStatus::Training => None,
        };
        if let Some(event_type) = event_type {
            state
                .publish(DomainEvent::new(
                    event_type,
                    voice.tenant_id,
                    json!({
                        "voice_id": voice.id,
                        "status": voice.status,
                        "training_info": voice.training_info,
                    }),
                ))
                .await;
        }
    }

    Ok(Json(VoiceStatusResponse {
        voice_id: voice.id,
        status: voice.status,
    }))
}

/// Egress retry result.
#[derive(Debug, Serialize)]
pub struct RetryResponse {
    /// Deliveries attempted again.
    pub requeued_count: usize,
}

/// Re-attempt failed egress deliveries that still have attempts left.
pub async fn retry_webhook_deliveries(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
) -> Result<Json<RetryResponse>, ApiError> {
    let requeued_count = state.egress.retry_failed().await?;
    Ok(Json(RetryResponse { requeued_count }))
}
