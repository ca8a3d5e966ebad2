//! Call handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use trudy_core::{
    is_e164, AgentId, AgentStatus, AuditAction, Call, CallDirection, CallId, CallStatus,
    DomainEvent, EventType,
};
use trudy_store::CallFilter;

use super::{created, ok, paged, Envelope, ListEnvelope, PageQuery};
use crate::audit;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;
use crate::ultravox::CreateCallRequest;

/// Credits an outbound call needs up front.
pub const OUTBOUND_CALL_MIN_CREDITS: i64 = 1;

/// Recording and transcription settings for a call.
#[derive(Debug, Clone, Deserialize)]
pub struct CallSettings {
    /// Record the call.
    #[serde(default = "enabled")]
    pub recording_enabled: bool,
    /// Transcribe the call.
    #[serde(default = "enabled")]
    pub transcription_enabled: bool,
    /// Opening line.
    #[serde(default)]
    pub greeting: Option<String>,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            recording_enabled: true,
            transcription_enabled: true,
            greeting: None,
        }
    }
}

fn enabled() -> bool {
    true
}

/// Create call request.
#[derive(Debug, Deserialize)]
pub struct CreateCallBody {
    /// Agent handling the call.
    pub agent_id: AgentId,
    /// E.164 number.
    pub phone_number: String,
    /// Inbound or outbound.
    pub direction: CallDirection,
    /// Provider settings.
    #[serde(default)]
    pub call_settings: CallSettings,
    /// Context echoed back by the provider.
    #[serde(default)]
    pub context: Option<Value>,
}

/// Create a call and hand it to Ultravox.
pub async fn create_call(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateCallBody>,
) -> Result<(StatusCode, Json<Envelope<Call>>), ApiError> {
    if !is_e164(&body.phone_number) {
        return Err(ApiError::Validation(
            "phone_number must be in E.164 format".into(),
        ));
    }

    let agent = state
        .store
        .get_agent(auth.tenant_id, body.agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Agent"))?;
    if agent.status != AgentStatus::Active {
        return Err(ApiError::Validation(format!(
            "Agent must be active (status: {})",
            agent.status
        )));
    }

    if body.direction == CallDirection::Outbound {
        let tenant = state
            .store
            .get_tenant(auth.tenant_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Client"))?;
        if !tenant.has_sufficient_credits(OUTBOUND_CALL_MIN_CREDITS) {
            return Err(ApiError::InsufficientCredits {
                balance: tenant.credits_balance,
                required: OUTBOUND_CALL_MIN_CREDITS,
            });
        }
    }

    let mut call = Call::new(auth.tenant_id, agent.id, body.phone_number, body.direction);
    call.context = body.context.unwrap_or_else(|| json!({}));
    call.call_settings = json!({
        "recording_enabled": body.call_settings.recording_enabled,
        "transcription_enabled": body.call_settings.transcription_enabled,
        "greeting": body.call_settings.greeting,
    });
    state.store.insert_call(&call).await?;

    let request = CreateCallRequest {
        agent_id: agent.ultravox_agent_id.clone(),
        phone_number: call.phone_number.clone(),
        direction: call.direction.to_string(),
        call_settings: call.call_settings.clone(),
        context: call.context.clone(),
    };
    match state.ultravox.create_call(&request).await {
        Ok(ultravox_call_id) => {
            call.ultravox_call_id = Some(ultravox_call_id);
            call.updated_at = chrono::Utc::now();
            state.store.update_call(&call).await?;
        }
        Err(e) => {
            tracing::warn!(call_id = %call.id, error = %e, "Ultravox rejected call");
            call.transition(CallStatus::Failed);
            call.error_message = Some(e.to_string());
            state.store.update_call(&call).await?;
            return Err(e.into());
        }
    }

    tracing::info!(
        call_id = %call.id,
        tenant_id = %call.tenant_id,
        direction = %call.direction,
        "Call created"
    );
    audit::record(&state, audit::entry(&auth, AuditAction::Insert, "calls", call.id)).await;
    state
        .publish(DomainEvent::new(
            EventType::CallCreated,
            call.tenant_id,
            json!({
                "call_id": call.id,
                "agent_id": call.agent_id,
                "ultravox_call_id": call.ultravox_call_id,
                "phone_number": call.phone_number,
                "direction": call.direction,
            }),
        ))
        .await;

    Ok(created(call))
}

/// Call list filters.
#[derive(Debug, Deserialize)]
pub struct ListCallsQuery {
    /// Only calls handled by this agent.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    /// Only calls in this status.
    #[serde(default)]
    pub status: Option<CallStatus>,
    /// Only calls in this direction.
    #[serde(default)]
    pub direction: Option<CallDirection>,
    /// Page size.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Rows to skip.
    #[serde(default)]
    pub offset: Option<usize>,
}

/// List the tenant's calls, newest first.
pub async fn list_calls(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListCallsQuery>,
) -> Result<Json<ListEnvelope<Call>>, ApiError> {
    let defaults = PageQuery::default();
    let page = PageQuery {
        limit: query.limit.unwrap_or(defaults.limit),
        offset: query.offset.unwrap_or(defaults.offset),
    }
    .page();
    let filter = CallFilter {
        agent_id: query.agent_id,
        status: query.status,
        direction: query.direction,
    };

    let calls = state.store.list_calls(auth.tenant_id, filter, page).await?;
    Ok(paged(calls, page))
}

/// Get one call.
pub async fn get_call(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(call_id): Path<CallId>,
) -> Result<Json<Envelope<Call>>, ApiError> {
    let call = state
        .store
        .get_call(auth.tenant_id, call_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Call"))?;
    Ok(ok(call))
}
