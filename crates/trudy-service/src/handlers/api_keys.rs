//! Tenant API key handlers.
//!
//! Keys are sealed before they are stored and never returned.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use trudy_core::{ApiKey, ApiKeyId, AuditAction, TtsProvider};

use super::{check_len, created, listed, ok, Envelope, ListEnvelope, PageQuery};
use crate::audit;
use crate::auth::{Manage, Require};
use crate::error::ApiError;
use crate::secrets::{Sealed, SecretError};
use crate::state::AppState;

/// Create key request.
#[derive(Debug, Deserialize)]
pub struct CreateApiKeyBody {
    /// Service the key is for.
    pub service: String,
    /// Display name.
    pub key_name: String,
    /// The key itself.
    pub api_key: String,
    /// Provider-specific settings.
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,
}

/// TTS provider configuration request.
#[derive(Debug, Deserialize)]
pub struct TtsProviderBody {
    /// Provider to configure.
    pub provider: TtsProvider,
    /// Provider API key.
    pub api_key: String,
    /// Default voice at the provider.
    #[serde(default)]
    pub voice_id: Option<String>,
    /// Provider-specific settings.
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,
}

fn seal(state: &AppState, api_key: &str) -> Result<Sealed, ApiError> {
    check_len("api_key", api_key, 1, 4096)?;
    state.key_cipher.seal(api_key).map_err(|e: SecretError| {
        tracing::error!(error = %e, "Failed to encrypt API key");
        ApiError::Validation("Failed to encrypt API key".into())
    })
}

/// Store a new key.
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Json(body): Json<CreateApiKeyBody>,
) -> Result<(StatusCode, Json<Envelope<ApiKey>>), ApiError> {
    check_len("service", &body.service, 1, 50)?;
    check_len("key_name", &body.key_name, 1, 100)?;
    let sealed = seal(&state, &body.api_key)?;

    let now = Utc::now();
    let key = ApiKey {
        id: ApiKeyId::generate(),
        tenant_id: auth.tenant_id,
        service: body.service,
        key_name: body.key_name,
        encrypted_key: sealed.value,
        encrypted: sealed.encrypted,
        settings: Value::Object(body.settings.unwrap_or_default()),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_api_key(&key).await.map_err(|e| match e {
        trudy_store::StoreError::Conflict(_) => {
            ApiError::Conflict("API key with this name already exists".into())
        }
        other => other.into(),
    })?;

    tracing::info!(
        api_key_id = %key.id,
        tenant_id = %key.tenant_id,
        service = %key.service,
        encrypted = key.encrypted,
        "API key stored"
    );
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Insert, "api_keys", key.id).with_metadata(json!({
            "service": key.service,
            "key_name": key.key_name,
            "encrypted": key.encrypted,
        })),
    )
    .await;
    Ok(created(key))
}

/// List keys (without key material).
pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListEnvelope<ApiKey>>, ApiError> {
    let keys = state.store.list_api_keys(auth.tenant_id).await?;
    Ok(listed(keys, query.page()))
}

/// Set the tenant's key for an external TTS provider, replacing any earlier
/// one.
pub async fn update_tts_provider(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Json(body): Json<TtsProviderBody>,
) -> Result<Json<Envelope<ApiKey>>, ApiError> {
    let sealed = seal(&state, &body.api_key)?;
    let mut settings = body.settings.unwrap_or_default();
    if let Some(voice_id) = body.voice_id {
        settings.insert("voice_id".into(), Value::String(voice_id));
    }
    let service = body.provider.as_str();
    let now = Utc::now();

    let existing = state
        .store
        .get_api_key_for_service(auth.tenant_id, service)
        .await?;
    let (key, action) = match existing {
        Some(mut key) => {
            key.encrypted_key = sealed.value;
            key.encrypted = sealed.encrypted;
            key.settings = Value::Object(settings);
            key.is_active = true;
            key.updated_at = now;
            state.store.update_api_key(&key).await?;
            (key, AuditAction::Update)
        }
        None => {
            let key = ApiKey {
                id: ApiKeyId::generate(),
                tenant_id: auth.tenant_id,
                service: service.to_string(),
                key_name: body.provider.key_name(),
                encrypted_key: sealed.value,
                encrypted: sealed.encrypted,
                settings: Value::Object(settings),
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            state.store.insert_api_key(&key).await?;
            (key, AuditAction::Insert)
        }
    };

    tracing::info!(
        api_key_id = %key.id,
        tenant_id = %key.tenant_id,
        provider = %body.provider,
        "TTS provider configured"
    );
    audit::record(
        &state,
        audit::entry(&auth, action, "api_keys", key.id)
            .with_metadata(json!({ "service": key.service, "encrypted": key.encrypted })),
    )
    .await;
    Ok(ok(key))
}
