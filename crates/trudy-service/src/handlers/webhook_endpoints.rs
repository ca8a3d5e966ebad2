//! Egress webhook endpoint handlers.
//!
//! The signing secret is returned once, in the creation response.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use trudy_core::{
    AuditAction, EventType, WebhookEndpoint, WebhookEndpointId, DEFAULT_DELIVERY_MAX_ATTEMPTS,
};

use super::{check_https, created, listed, ok, Deleted, Envelope, ListEnvelope, PageQuery};
use crate::audit;
use crate::auth::{AuthUser, Manage, Require};
use crate::crypto::generate_secret;
use crate::error::ApiError;
use crate::state::AppState;

/// Random bytes in a generated secret (hex encoded to 32 characters).
const SECRET_BYTES: usize = 16;

/// Create endpoint request.
#[derive(Debug, Deserialize)]
pub struct CreateEndpointBody {
    /// HTTPS URL to deliver to.
    pub url: String,
    /// Event types to deliver; `*` subscribes to everything.
    pub event_types: Vec<String>,
    /// Signing secret; generated when absent.
    #[serde(default)]
    pub secret: Option<String>,
    /// Whether deliveries are sent.
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Delivery attempts before giving up.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn enabled() -> bool {
    true
}

/// Update endpoint request. Absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateEndpointBody {
    /// New URL.
    #[serde(default)]
    pub url: Option<String>,
    /// New subscriptions.
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    /// Enable or disable deliveries.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// New attempt limit.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Creation response: the endpoint plus its secret.
#[derive(Debug, Serialize)]
pub struct CreatedEndpoint {
    /// The endpoint.
    #[serde(flatten)]
    pub endpoint: WebhookEndpoint,
    /// Signing secret. Not returned again.
    pub secret: String,
}

fn check_event_types(event_types: &[String]) -> Result<(), ApiError> {
    if event_types.is_empty() {
        return Err(ApiError::Validation(
            "event_types must name at least one event".into(),
        ));
    }
    if let Some(unknown) = event_types
        .iter()
        .find(|t| t.as_str() != "*" && t.parse::<EventType>().is_err())
    {
        return Err(ApiError::Validation(format!("Unknown event type: {unknown}")));
    }
    Ok(())
}

fn check_max_attempts(max_attempts: u32) -> Result<(), ApiError> {
    if max_attempts == 0 {
        return Err(ApiError::Validation("max_attempts must be at least 1".into()));
    }
    Ok(())
}

/// Register an endpoint.
pub async fn create_endpoint(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Json(body): Json<CreateEndpointBody>,
) -> Result<(StatusCode, Json<Envelope<CreatedEndpoint>>), ApiError> {
    check_https("url", &body.url)?;
    check_event_types(&body.event_types)?;
    let max_attempts = body.max_attempts.unwrap_or(DEFAULT_DELIVERY_MAX_ATTEMPTS);
    check_max_attempts(max_attempts)?;

    let secret = body
        .secret
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| generate_secret(SECRET_BYTES));
    let now = Utc::now();
    let endpoint = WebhookEndpoint {
        id: WebhookEndpointId::generate(),
        tenant_id: auth.tenant_id,
        url: body.url,
        event_types: body.event_types,
        secret: secret.clone(),
        enabled: body.enabled,
        max_attempts,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_endpoint(&endpoint).await?;

    tracing::info!(
        endpoint_id = %endpoint.id,
        tenant_id = %endpoint.tenant_id,
        events = ?endpoint.event_types,
        "Webhook endpoint registered"
    );
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Insert, "webhook_endpoints", endpoint.id),
    )
    .await;
    Ok(created(CreatedEndpoint { endpoint, secret }))
}

/// List endpoints.
pub async fn list_endpoints(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListEnvelope<WebhookEndpoint>>, ApiError> {
    let endpoints = state.store.list_endpoints(auth.tenant_id).await?;
    Ok(listed(endpoints, query.page()))
}

/// Get one endpoint.
pub async fn get_endpoint(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(endpoint_id): Path<WebhookEndpointId>,
) -> Result<Json<Envelope<WebhookEndpoint>>, ApiError> {
    let endpoint = state
        .store
        .get_endpoint(auth.tenant_id, endpoint_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Webhook endpoint"))?;
    Ok(ok(endpoint))
}

/// Edit an endpoint.
pub async fn update_endpoint(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Path(endpoint_id): Path<WebhookEndpointId>,
    Json(body): Json<UpdateEndpointBody>,
) -> Result<Json<Envelope<WebhookEndpoint>>, ApiError> {
    let mut endpoint = state
        .store
        .get_endpoint(auth.tenant_id, endpoint_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Webhook endpoint"))?;
    let before = endpoint.clone();

    if let Some(url) = body.url {
        check_https("url", &url)?;
        endpoint.url = url;
    }
    if let Some(event_types) = body.event_types {
        check_event_types(&event_types)?;
        endpoint.event_types = event_types;
    }
    if let Some(enabled) = body.enabled {
        endpoint.enabled = enabled;
    }
    if let Some(max_attempts) = body.max_attempts {
        check_max_attempts(max_attempts)?;
        endpoint.max_attempts = max_attempts;
    }
    endpoint.updated_at = Utc::now();
    state.store.update_endpoint(&endpoint).await?;
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Update, "webhook_endpoints", endpoint.id)
            .with_diff(audit::diff(&before, &endpoint)),
    )
    .await;

    Ok(ok(endpoint))
}

/// Remove an endpoint.
pub async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Path(endpoint_id): Path<WebhookEndpointId>,
) -> Result<Json<Envelope<Deleted<WebhookEndpointId>>>, ApiError> {
    if !state.store.delete_endpoint(auth.tenant_id, endpoint_id).await? {
        return Err(ApiError::not_found("Webhook endpoint"));
    }
    tracing::info!(endpoint_id = %endpoint_id, "Webhook endpoint deleted");
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Delete, "webhook_endpoints", endpoint_id),
    )
    .await;
    Ok(ok(Deleted {
        id: endpoint_id,
        deleted: true,
    }))
}
