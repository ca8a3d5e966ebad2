//! Tool handlers.
//!
//! Tools are mirrored to Ultravox. Creation fails if the provider rejects the
//! tool; updates and deletes are applied locally and pushed best-effort.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use trudy_core::{AuditAction, Tool, ToolId, ToolStatus};

use super::{
    check_https, check_len, created, listed, ok, Deleted, Envelope, ListEnvelope, PageQuery,
};
use crate::audit;
use crate::auth::{AuthUser, Manage, Require};
use crate::error::ApiError;
use crate::state::AppState;
use crate::ultravox::ToolDefinition;

const METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE"];

/// Create tool request.
#[derive(Debug, Deserialize)]
pub struct CreateToolBody {
    /// Tool name.
    pub name: String,
    /// Description shown to the model.
    #[serde(default)]
    pub description: Option<String>,
    /// Grouping label.
    #[serde(default)]
    pub category: Option<String>,
    /// HTTPS endpoint the tool calls.
    pub endpoint: String,
    /// HTTP method.
    pub method: String,
    /// Authentication settings.
    #[serde(default)]
    pub authentication: Option<Value>,
    /// Parameter schema.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Response schema.
    #[serde(default)]
    pub response_schema: Option<Value>,
}

/// Update tool request. Absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateToolBody {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New category.
    #[serde(default)]
    pub category: Option<String>,
    /// New endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// New method.
    #[serde(default)]
    pub method: Option<String>,
    /// New authentication settings.
    #[serde(default)]
    pub authentication: Option<Value>,
    /// New parameter schema.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// New response schema.
    #[serde(default)]
    pub response_schema: Option<Value>,
}

fn check_method(method: &str) -> Result<String, ApiError> {
    let upper = method.to_ascii_uppercase();
    if METHODS.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(ApiError::Validation(format!(
            "method must be one of {}",
            METHODS.join(", ")
        )))
    }
}

fn definition(tool: &Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name.clone(),
        description: tool.description.clone(),
        endpoint: tool.endpoint.clone(),
        method: tool.method.clone(),
        authentication: tool.authentication.clone(),
        parameters: tool.parameters.clone(),
        response_schema: tool.response_schema.clone(),
    }
}

/// Create a tool locally and on Ultravox.
pub async fn create_tool(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Json(body): Json<CreateToolBody>,
) -> Result<(StatusCode, Json<Envelope<Tool>>), ApiError> {
    check_len("name", &body.name, 1, 100)?;
    check_https("endpoint", &body.endpoint)?;
    let method = check_method(&body.method)?;

    let now = Utc::now();
    let mut tool = Tool {
        id: ToolId::generate(),
        tenant_id: auth.tenant_id,
        ultravox_tool_id: None,
        name: body.name,
        description: body.description,
        category: body.category,
        endpoint: body.endpoint,
        method,
        authentication: body.authentication.unwrap_or_else(|| json!({})),
        parameters: body.parameters.unwrap_or_else(|| json!({})),
        response_schema: body.response_schema.unwrap_or_else(|| json!({})),
        status: ToolStatus::Creating,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_tool(&tool).await?;

    match state.ultravox.create_tool(&definition(&tool)).await {
        Ok(ultravox_tool_id) => {
            tool.ultravox_tool_id = Some(ultravox_tool_id);
            tool.status = ToolStatus::Active;
        }
        Err(e) => {
            tracing::warn!(tool_id = %tool.id, error = %e, "Ultravox rejected tool");
            tool.status = ToolStatus::Failed;
            tool.updated_at = Utc::now();
            state.store.update_tool(&tool).await?;
            return Err(e.into());
        }
    }
    tool.updated_at = Utc::now();
    state.store.update_tool(&tool).await?;

    tracing::info!(tool_id = %tool.id, tenant_id = %tool.tenant_id, "Tool created");
    audit::record(&state, audit::entry(&auth, AuditAction::Insert, "tools", tool.id)).await;
    Ok(created(tool))
}

/// List tools.
pub async fn list_tools(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListEnvelope<Tool>>, ApiError> {
    let tools = state.store.list_tools(auth.tenant_id).await?;
    Ok(listed(tools, query.page()))
}

/// Get one tool.
pub async fn get_tool(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(tool_id): Path<ToolId>,
) -> Result<Json<Envelope<Tool>>, ApiError> {
    let tool = state
        .store
        .get_tool(auth.tenant_id, tool_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Tool"))?;
    Ok(ok(tool))
}

/// Edit a tool.
pub async fn update_tool(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Path(tool_id): Path<ToolId>,
    Json(body): Json<UpdateToolBody>,
) -> Result<Json<Envelope<Tool>>, ApiError> {
    let mut tool = state
        .store
        .get_tool(auth.tenant_id, tool_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Tool"))?;
    let before = tool.clone();

    // Category is local-only; every other field is part of the remote definition.
    let mut remote_changed = false;
    if let Some(name) = body.name {
        check_len("name", &name, 1, 100)?;
        tool.name = name;
        remote_changed = true;
    }
    if let Some(description) = body.description {
        tool.description = Some(description);
        remote_changed = true;
    }
    if let Some(endpoint) = body.endpoint {
        check_https("endpoint", &endpoint)?;
        tool.endpoint = endpoint;
        remote_changed = true;
    }
    if let Some(method) = body.method {
        tool.method = check_method(&method)?;
        remote_changed = true;
    }
    if let Some(authentication) = body.authentication {
        tool.authentication = authentication;
        remote_changed = true;
    }
    if let Some(parameters) = body.parameters {
        tool.parameters = parameters;
        remote_changed = true;
    }
    if let Some(response_schema) = body.response_schema {
        tool.response_schema = response_schema;
        remote_changed = true;
    }
    let category_changed = body.category.is_some();
    if let Some(category) = body.category {
        tool.category = Some(category);
    }
    if !remote_changed && !category_changed {
        return Ok(ok(tool));
    }

    tool.updated_at = Utc::now();
    state.store.update_tool(&tool).await?;
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Update, "tools", tool.id)
            .with_diff(audit::diff(&before, &tool)),
    )
    .await;

    if let (Some(ultravox_tool_id), true) = (&tool.ultravox_tool_id, remote_changed) {
        if let Err(e) = state
            .ultravox
            .update_tool(ultravox_tool_id, &definition(&tool))
            .await
        {
            tracing::warn!(tool_id = %tool.id, error = %e, "Failed to push tool update to Ultravox");
        }
    }

    Ok(ok(tool))
}

/// Delete a tool locally and, best-effort, on Ultravox.
pub async fn delete_tool(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Path(tool_id): Path<ToolId>,
) -> Result<Json<Envelope<Deleted<ToolId>>>, ApiError> {
    let tool = state
        .store
        .get_tool(auth.tenant_id, tool_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Tool"))?;

    if let Some(ultravox_tool_id) = &tool.ultravox_tool_id {
        if let Err(e) = state.ultravox.delete_tool(ultravox_tool_id).await {
            tracing::warn!(tool_id = %tool.id, error = %e, "Failed to delete tool from Ultravox");
        }
    }

    state.store.delete_tool(auth.tenant_id, tool_id).await?;
    tracing::info!(tool_id = %tool_id, "Tool deleted");
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Delete, "tools", tool_id)
            .with_metadata(json!({ "name": tool.name })),
    )
    .await;

    Ok(ok(Deleted {
        id: tool_id,
        deleted: true,
    }))
}
