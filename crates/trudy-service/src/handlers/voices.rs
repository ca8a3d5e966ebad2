//! Voice handlers.
//!
//! `native` voices are cloned from audio samples: they cost
//! [`NATIVE_VOICE_TRAINING_CREDITS`], start in `training` and become usable
//! once Ultravox reports the training result. `external` voices reference a
//! provider voice and are active immediately.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use trudy_core::{
    AuditAction, CreditLedgerEntry, ReferenceType, Voice, VoiceId, VoiceStatus, VoiceStrategy,
    NATIVE_VOICE_TRAINING_CREDITS,
};

use super::{check_len, created, listed, ok, Envelope, ListEnvelope, PageQuery};
use crate::audit;
use crate::auth::{AuthUser, Manage, Require};
use crate::error::ApiError;
use crate::state::AppState;
use crate::ultravox::{CreateVoiceRequest, VoiceSample};

const DEFAULT_PROVIDER: &str = "elevenlabs";
const DEFAULT_LANGUAGE: &str = "en-US";
const MIN_SAMPLES: usize = 3;
const MIN_TOTAL_SAMPLE_SECONDS: f64 = 15.0;
const SAMPLE_SECONDS: std::ops::RangeInclusive<f64> = 3.0..=10.0;

/// Where a voice comes from.
#[derive(Debug, Default, Deserialize)]
pub struct VoiceSource {
    /// Training samples (native).
    #[serde(default)]
    pub samples: Vec<VoiceSample>,
    /// Provider voice to reference (external).
    #[serde(default)]
    pub provider_voice_id: Option<String>,
}

/// Provider overrides.
#[derive(Debug, Default, Deserialize)]
pub struct ProviderOverrides {
    /// TTS provider.
    #[serde(default)]
    pub provider: Option<String>,
}

/// Create voice request.
#[derive(Debug, Deserialize)]
pub struct CreateVoiceBody {
    /// Voice name.
    pub name: String,
    /// `native`, `external` or `auto`.
    pub strategy: VoiceStrategy,
    /// Samples or provider reference.
    #[serde(default)]
    pub source: VoiceSource,
    /// Provider settings.
    #[serde(default)]
    pub provider_overrides: Option<ProviderOverrides>,
}

/// `auto` clones when samples are supplied and references otherwise.
fn resolve_strategy(strategy: VoiceStrategy, source: &VoiceSource) -> VoiceStrategy {
    match strategy {
        VoiceStrategy::Auto if source.samples.is_empty() => VoiceStrategy::External,
        VoiceStrategy::Auto => VoiceStrategy::Native,
        other => other,
    }
}

fn check_samples(samples: &[VoiceSample]) -> Result<(), ApiError> {
    if samples.len() < MIN_SAMPLES {
        return Err(ApiError::Validation(format!(
            "Native voices need at least {MIN_SAMPLES} samples"
        )));
    }
    if let Some(bad) = samples
        .iter()
        .find(|s| !SAMPLE_SECONDS.contains(&s.duration_seconds))
    {
        return Err(ApiError::Validation(format!(
            "Samples must be 3-10 seconds long (got {})",
            bad.duration_seconds
        )));
    }
    let total: f64 = samples.iter().map(|s| s.duration_seconds).sum();
    if total < MIN_TOTAL_SAMPLE_SECONDS {
        return Err(ApiError::Validation(format!(
            "Samples must total at least {MIN_TOTAL_SAMPLE_SECONDS} seconds"
        )));
    }
    Ok(())
}

/// Create a voice.
pub async fn create_voice(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Json(body): Json<CreateVoiceBody>,
) -> Result<(StatusCode, Json<Envelope<Voice>>), ApiError> {
    check_len("name", &body.name, 1, 100)?;
    let strategy = resolve_strategy(body.strategy, &body.source);

    if strategy.trains() {
        check_samples(&body.source.samples)?;
        let tenant = state
            .store
            .get_tenant(auth.tenant_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Client"))?;
        if !tenant.has_sufficient_credits(NATIVE_VOICE_TRAINING_CREDITS) {
            return Err(ApiError::InsufficientCredits {
                balance: tenant.credits_balance,
                required: NATIVE_VOICE_TRAINING_CREDITS,
            });
        }
    } else if body.source.provider_voice_id.is_none() {
        return Err(ApiError::Validation(
            "source.provider_voice_id is required for external voices".into(),
        ));
    }

    let provider = body
        .provider_overrides
        .and_then(|o| o.provider)
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
    let now = Utc::now();
    let mut voice = Voice {
        id: VoiceId::generate(),
        tenant_id: auth.tenant_id,
        name: body.name,
        provider,
        voice_type: if strategy.trains() { "custom" } else { "reference" }.to_string(),
        language: DEFAULT_LANGUAGE.to_string(),
        status: if strategy.trains() {
            VoiceStatus::Training
        } else {
            VoiceStatus::Active
        },
        training_info: if strategy.trains() {
            json!({ "progress": 0, "started_at": now.to_rfc3339() })
        } else {
            json!({})
        },
        ultravox_voice_id: None,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_voice(&voice).await?;

    let request = CreateVoiceRequest {
        name: voice.name.clone(),
        provider: voice.provider.clone(),
        language: voice.language.clone(),
        voice_type: voice.voice_type.clone(),
        samples: if strategy.trains() {
            body.source.samples
        } else {
            Vec::new()
        },
        provider_voice_id: body.source.provider_voice_id,
    };
    match state.ultravox.create_voice(&request).await {
        Ok(ultravox_voice_id) => {
            voice.ultravox_voice_id = Some(ultravox_voice_id);
            voice.updated_at = Utc::now();
            state.store.update_voice(&voice).await?;
        }
        Err(e) => {
            tracing::warn!(voice_id = %voice.id, error = %e, "Ultravox rejected voice");
            voice.status = VoiceStatus::Failed;
            voice.training_info = json!({ "error_message": e.to_string() });
            voice.updated_at = Utc::now();
            state.store.update_voice(&voice).await?;
            return Err(e.into());
        }
    }

    if strategy.trains() {
        let entry = CreditLedgerEntry::spent(
            voice.tenant_id,
            NATIVE_VOICE_TRAINING_CREDITS,
            ReferenceType::Voice,
            voice.id.to_string(),
            format!("Voice training: {}", voice.name),
        )?;
        let outcome = state.store.apply_ledger_entry(&entry).await?;
        tracing::info!(
            voice_id = %voice.id,
            credits = NATIVE_VOICE_TRAINING_CREDITS,
            balance = outcome.balance(),
            "Voice training charged"
        );
    }

    tracing::info!(
        voice_id = %voice.id,
        tenant_id = %voice.tenant_id,
        strategy = %strategy,
        "Voice created"
    );
    audit::record(
        &state,
        audit::entry(&auth, AuditAction::Insert, "voices", voice.id)
            .with_metadata(json!({ "strategy": strategy.as_str() })),
    )
    .await;
    Ok(created(voice))
}

/// List voices.
pub async fn list_voices(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListEnvelope<Voice>>, ApiError> {
    let voices = state.store.list_voices(auth.tenant_id).await?;
    Ok(listed(voices, query.page()))
}

/// Get one voice.
pub async fn get_voice(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(voice_id): Path<VoiceId>,
) -> Result<Json<Envelope<Voice>>, ApiError> {
    let voice = state
        .store
        .get_voice(auth.tenant_id, voice_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Voice"))?;
    Ok(ok(voice))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seconds: f64) -> VoiceSample {
        VoiceSample {
            audio_url: "https://cdn.example.com/a.wav".into(),
            duration_seconds: seconds,
        }
    }

    #[test]
    fn auto_strategy_follows_the_source() {
        let empty = VoiceSource::default();
        assert_eq!(
            resolve_strategy(VoiceStrategy::Auto, &empty),
            VoiceStrategy::External
        );
        let with_samples = VoiceSource {
            samples: vec![sample(5.0)],
            provider_voice_id: None,
        };
        assert_eq!(
            resolve_strategy(VoiceStrategy::Auto, &with_samples),
            VoiceStrategy::Native
        );
        assert_eq!(
            resolve_strategy(VoiceStrategy::External, &with_samples),
            VoiceStrategy::External
        );
    }

    #[test]
    fn native_samples_are_checked() {
        assert!(check_samples(&[sample(5.0), sample(5.0)]).is_err());
        assert!(check_samples(&[sample(5.0), sample(5.0), sample(4.0)]).is_err());
        assert!(check_samples(&[sample(5.0), sample(5.0), sample(11.0)]).is_err());
        assert!(check_samples(&[sample(5.0), sample(5.0), sample(5.0)]).is_ok());
    }
}
