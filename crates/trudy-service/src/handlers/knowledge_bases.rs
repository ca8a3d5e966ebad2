//! Knowledge base handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use trudy_core::{
    AuditAction, DomainEvent, EventType, KnowledgeBase, KnowledgeBaseId, KnowledgeBaseStatus,
};

use super::{check_len, check_max_len, created, listed, ok, Envelope, ListEnvelope, PageQuery};
use crate::audit;
use crate::auth::{AuthUser, Manage, Require};
use crate::error::ApiError;
use crate::state::AppState;
use crate::ultravox::CreateCorpusRequest;

/// Create knowledge base request.
#[derive(Debug, Deserialize)]
pub struct CreateKnowledgeBaseBody {
    /// Name (1-100 characters).
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Content language.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en-US".to_string()
}

/// Create a knowledge base backed by an Ultravox corpus.
pub async fn create_knowledge_base(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Json(body): Json<CreateKnowledgeBaseBody>,
) -> Result<(StatusCode, Json<Envelope<KnowledgeBase>>), ApiError> {
    check_len("name", &body.name, 1, 100)?;
    check_max_len("description", body.description.as_deref(), 500)?;

    let now = Utc::now();
    let mut kb = KnowledgeBase {
        id: KnowledgeBaseId::generate(),
        tenant_id: auth.tenant_id,
        name: body.name,
        description: body.description,
        language: body.language,
        ultravox_corpus_id: None,
        status: KnowledgeBaseStatus::Creating,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_knowledge_base(&kb).await?;

    let request = CreateCorpusRequest {
        name: kb.name.clone(),
        description: kb.description.clone(),
        language: kb.language.clone(),
    };
    match state.ultravox.create_corpus(&request).await {
        Ok(corpus_id) => {
            kb.ultravox_corpus_id = Some(corpus_id);
            kb.status = KnowledgeBaseStatus::Ready;
        }
        Err(e) => {
            tracing::warn!(kb_id = %kb.id, error = %e, "Ultravox rejected corpus");
            kb.status = KnowledgeBaseStatus::Failed;
            kb.updated_at = Utc::now();
            state.store.update_knowledge_base(&kb).await?;
            return Err(e.into());
        }
    }
    kb.updated_at = Utc::now();
    state.store.update_knowledge_base(&kb).await?;

    tracing::info!(kb_id = %kb.id, tenant_id = %kb.tenant_id, "Knowledge base created");
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Insert, "knowledge_bases", kb.id),
    )
    .await;
    state
        .publish(DomainEvent::new(
            EventType::KnowledgeBaseCreated,
            kb.tenant_id,
            json!({
                "kb_id": kb.id,
                "ultravox_corpus_id": kb.ultravox_corpus_id,
            }),
        ))
        .await;

    Ok(created(kb))
}

/// List knowledge bases.
pub async fn list_knowledge_bases(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListEnvelope<KnowledgeBase>>, ApiError> {
    let kbs = state.store.list_knowledge_bases(auth.tenant_id).await?;
    Ok(listed(kbs, query.page()))
}

/// Get one knowledge base.
pub async fn get_knowledge_base(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(kb_id): Path<KnowledgeBaseId>,
) -> Result<Json<Envelope<KnowledgeBase>>, ApiError> {
    let kb = state
        .store
        .get_knowledge_base(auth.tenant_id, kb_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Knowledge base"))?;
    Ok(ok(kb))
}
