//! Agent handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use trudy_core::{
    Agent, AgentId, AgentStatus, AuditAction, DomainEvent, EventType, KnowledgeBaseId, KnowledgeBaseStatus,
    TenantId, ToolId, Voice, VoiceId, VoiceStatus,
};

use super::{check_len, check_max_len, created, listed, ok, Envelope, ListEnvelope, PageQuery};
use crate::audit;
use crate::auth::{AuthUser, Manage, Require};
use crate::error::ApiError;
use crate::state::AppState;
use crate::ultravox::{AgentKnowledgeBase, AgentVoice, CreateAgentRequest};

/// Model used when the request names none.
pub const DEFAULT_MODEL: &str = "fixie-ai/ultravox-v0_4-8k";

/// A tool binding on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTool {
    /// Tool to bind.
    pub tool_id: ToolId,
    /// Whether the agent may call it.
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Fixed parameters for the tool.
    #[serde(default)]
    pub parameters: Option<Value>,
}

fn enabled() -> bool {
    true
}

/// Create agent request.
#[derive(Debug, Deserialize)]
pub struct CreateAgentBody {
    /// Agent name (1-100 characters).
    pub name: String,
    /// Description (at most 500 characters).
    #[serde(default)]
    pub description: Option<String>,
    /// Voice the agent speaks with; must be active.
    pub voice_id: VoiceId,
    /// System prompt (10-5000 characters).
    pub system_prompt: String,
    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Tool bindings.
    #[serde(default)]
    pub tools: Vec<AgentTool>,
    /// Knowledge bases; each must be ready.
    #[serde(default)]
    pub knowledge_bases: Vec<KnowledgeBaseId>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

/// Update agent request. Absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateAgentBody {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New voice; must be active.
    #[serde(default)]
    pub voice_id: Option<VoiceId>,
    /// New system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// New model.
    #[serde(default)]
    pub model: Option<String>,
    /// Replacement tool bindings.
    #[serde(default)]
    pub tools: Option<Vec<AgentTool>>,
    /// Replacement knowledge bases.
    #[serde(default)]
    pub knowledge_bases: Option<Vec<KnowledgeBaseId>>,
}

async fn require_active_voice(
    state: &AppState,
    tenant_id: TenantId,
    voice_id: VoiceId,
) -> Result<Voice, ApiError> {
    let voice = state
        .store
        .get_voice(tenant_id, voice_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Voice"))?;
    if voice.status != VoiceStatus::Active {
        return Err(ApiError::Validation(format!(
            "Voice must be active (status: {})",
            voice.status
        )));
    }
    Ok(voice)
}

/// Check every knowledge base is ready and collect their corpus IDs.
async fn ready_corpora(
    state: &AppState,
    tenant_id: TenantId,
    kb_ids: &[KnowledgeBaseId],
) -> Result<Vec<String>, ApiError> {
    let mut corpus_ids = Vec::with_capacity(kb_ids.len());
    for kb_id in kb_ids {
        let kb = state
            .store
            .get_knowledge_base(tenant_id, *kb_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Knowledge base"))?;
        if kb.status != KnowledgeBaseStatus::Ready {
            return Err(ApiError::Validation(format!(
                "Knowledge base {kb_id} must be ready (status: {})",
                kb.status
            )));
        }
        corpus_ids.extend(kb.ultravox_corpus_id);
    }
    Ok(corpus_ids)
}

fn tool_values(tools: &[AgentTool]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|t| serde_json::to_value(t).ok())
        .collect()
}

/// Create an agent locally and on Ultravox.
pub async fn create_agent(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Json(body): Json<CreateAgentBody>,
) -> Result<(StatusCode, Json<Envelope<Agent>>), ApiError> {
    check_len("name", &body.name, 1, 100)?;
    check_max_len("description", body.description.as_deref(), 500)?;
    check_len("system_prompt", &body.system_prompt, 10, 5000)?;

    let voice = require_active_voice(&state, auth.tenant_id, body.voice_id).await?;
    let corpus_ids = ready_corpora(&state, auth.tenant_id, &body.knowledge_bases).await?;

    let now = Utc::now();
    let mut agent = Agent {
        id: AgentId::generate(),
        tenant_id: auth.tenant_id,
        ultravox_agent_id: None,
        name: body.name,
        description: body.description,
        voice_id: voice.id,
        system_prompt: body.system_prompt,
        model: body.model,
        tools: tool_values(&body.tools),
        knowledge_bases: body.knowledge_bases,
        status: AgentStatus::Creating,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_agent(&agent).await?;

    let request = CreateAgentRequest {
        name: agent.name.clone(),
        voice: AgentVoice {
            provider: voice.provider.clone(),
            voice_id: voice.ultravox_voice_id.clone(),
        },
        system_prompt: agent.system_prompt.clone(),
        model: agent.model.clone(),
        settings: json!({
            "language": voice.language,
            "response_timeout": 30,
            "max_conversation_turns": 50,
        }),
        knowledge_base: (!corpus_ids.is_empty()).then(|| AgentKnowledgeBase {
            corpus_ids,
            search_enabled: true,
            context_window: 5,
        }),
        tools: agent.tools.clone(),
    };

    match state.ultravox.create_agent(&request).await {
        Ok(ultravox_agent_id) => {
            agent.ultravox_agent_id = Some(ultravox_agent_id);
            agent.status = AgentStatus::Active;
        }
        Err(e) => {
            tracing::warn!(agent_id = %agent.id, error = %e, "Ultravox rejected agent");
            agent.status = AgentStatus::Failed;
            agent.updated_at = Utc::now();
            state.store.update_agent(&agent).await?;
            return Err(e.into());
        }
    }
    agent.updated_at = Utc::now();
    state.store.update_agent(&agent).await?;

    tracing::info!(agent_id = %agent.id, tenant_id = %agent.tenant_id, "Agent created");
    audit::record(&state, audit::entry(&auth, AuditAction::Insert, "agents", agent.id)).await;
    state
        .publish(DomainEvent::new(
            EventType::AgentCreated,
            agent.tenant_id,
            json!({
                "agent_id": agent.id,
                "ultravox_agent_id": agent.ultravox_agent_id,
                "name": agent.name,
            }),
        ))
        .await;

    Ok(created(agent))
}

/// List agents.
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListEnvelope<Agent>>, ApiError> {
    let agents = state.store.list_agents(auth.tenant_id).await?;
    Ok(listed(agents, query.page()))
}

/// Get one agent.
pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(agent_id): Path<AgentId>,
) -> Result<Json<Envelope<Agent>>, ApiError> {
    let agent = state
        .store
        .get_agent(auth.tenant_id, agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Agent"))?;
    Ok(ok(agent))
}

/// Edit an agent, then push the change to Ultravox on a best-effort basis.
pub async fn update_agent(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Path(agent_id): Path<AgentId>,
    Json(body): Json<UpdateAgentBody>,
) -> Result<Json<Envelope<Agent>>, ApiError> {
    let mut agent = state
        .store
        .get_agent(auth.tenant_id, agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Agent"))?;
    let before = agent.clone();

    let mut changes = Map::new();
    if let Some(voice_id) = body.voice_id {
        let voice = require_active_voice(&state, auth.tenant_id, voice_id).await?;
        agent.voice_id = voice.id;
        changes.insert(
            "voice".into(),
            json!({ "provider": voice.provider, "voice_id": voice.ultravox_voice_id }),
        );
    }
    if let Some(name) = body.name {
        check_len("name", &name, 1, 100)?;
        changes.insert("name".into(), json!(name));
        agent.name = name;
    }
    if let Some(description) = body.description {
        check_max_len("description", Some(&description), 500)?;
        agent.description = Some(description);
    }
    if let Some(system_prompt) = body.system_prompt {
        check_len("system_prompt", &system_prompt, 10, 5000)?;
        changes.insert("system_prompt".into(), json!(system_prompt));
        agent.system_prompt = system_prompt;
    }
    if let Some(model) = body.model {
        changes.insert("model".into(), json!(model));
        agent.model = model;
    }
    if let Some(tools) = body.tools {
        agent.tools = tool_values(&tools);
        changes.insert("tools".into(), Value::Array(agent.tools.clone()));
    }
    if let Some(kb_ids) = body.knowledge_bases {
        let corpus_ids = ready_corpora(&state, auth.tenant_id, &kb_ids).await?;
        agent.knowledge_bases = kb_ids;
        changes.insert(
            "knowledge_base".into(),
            json!({ "corpus_ids": corpus_ids, "search_enabled": true, "context_window": 5 }),
        );
    }

    agent.updated_at = Utc::now();
    state.store.update_agent(&agent).await?;
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Update, "agents", agent.id)
            .with_diff(audit::diff(&before, &agent)),
    )
    .await;

    if let (Some(ultravox_agent_id), false) = (&agent.ultravox_agent_id, changes.is_empty()) {
        if let Err(e) = state
            .ultravox
            .update_agent(ultravox_agent_id, &Value::Object(changes))
            .await
        {
            tracing::warn!(agent_id = %agent.id, error = %e, "Failed to push agent update to Ultravox");
        }
    }

    Ok(ok(agent))
}
