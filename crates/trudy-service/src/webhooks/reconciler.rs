//! Applies verified provider events to local state.
//!
//! Every handler here is safe to run more than once for the same event: call
//! billing is deduplicated by the ledger's unique key, terminal statuses are
//! never regressed, and domain events are only published when something
//! actually changed.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use trudy_core::{
    billed_minutes, call_duration_seconds, credits_for_cents, Call, CallStatus, CampaignId,
    CampaignStats, ContactStatus, CreditLedgerEntry, DomainEvent, EventType, ReferenceType,
    SubscriptionStatus, TenantId, VoiceStatus,
};
use trudy_store::LedgerOutcome;

use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// Payloads
// ============================================================================

/// An Ultravox webhook body.
#[derive(Debug, Clone, Deserialize)]
pub struct UltravoxEvent {
    /// Event type, e.g. `call.completed`.
    pub event: String,
    /// Provider call ID.
    #[serde(default)]
    pub call_id: Option<String>,
    /// Provider voice ID.
    #[serde(default)]
    pub voice_id: Option<String>,
    /// When the provider observed the event (RFC 3339).
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Event details.
    #[serde(default)]
    pub data: UltravoxEventData,
    /// Top-level error message (voice training failures).
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Details carried by call and voice events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UltravoxEventData {
    /// Call duration.
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    /// Provider cost.
    #[serde(default)]
    pub cost_usd: Option<f64>,
    /// Recording location.
    #[serde(default)]
    pub recording_url: Option<String>,
    /// Failure reason.
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A Stripe webhook body.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    /// Stripe event ID.
    pub id: String,
    /// Event type, e.g. `payment_intent.succeeded`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: StripeEventData,
}

/// The `data` member of a Stripe event.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    /// The object the event is about.
    pub object: Value,
}

/// What applying an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State changed.
    Applied,
    /// The event had already been applied.
    Duplicate,
    /// No local record matches the event.
    NoMatch,
    /// The event type is not handled.
    Ignored,
}

impl Outcome {
    /// Wire name reported back to the sender.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::NoMatch => "no_match",
            Self::Ignored => "ignored",
        }
    }
}

// ============================================================================
// Ultravox
// ============================================================================

/// Apply an Ultravox event.
pub async fn apply_ultravox(state: &AppState, event: UltravoxEvent) -> Result<Outcome, ApiError> {
    let Ok(event_type) = event.event.parse::<EventType>() else {
        tracing::info!(event = %event.event, "Ignoring unhandled Ultravox event");
        return Ok(Outcome::Ignored);
    };

    match event_type {
        EventType::CallStarted => call_started(state, &event).await,
        EventType::CallCompleted => call_completed(state, &event).await,
        EventType::CallFailed => call_failed(state, &event).await,
        EventType::VoiceTrainingCompleted | EventType::VoiceTrainingFailed => {
            voice_training(state, &event, event_type).await
        }
        _ => {
            tracing::info!(event = %event.event, "Ignoring unhandled Ultravox event");
            Ok(Outcome::Ignored)
        }
    }
}

fn event_time(event: &UltravoxEvent) -> DateTime<Utc> {
    event
        .timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map_or_else(Utc::now, |ts| ts.with_timezone(&Utc))
}

async fn find_call(state: &AppState, event: &UltravoxEvent) -> Result<Option<Call>, ApiError> {
    let Some(ultravox_call_id) = event.call_id.as_deref() else {
        tracing::warn!(event = %event.event, "Call event without call_id");
        return Ok(None);
    };
    let call = state.store.find_call_by_ultravox_id(ultravox_call_id).await?;
    if call.is_none() {
        tracing::warn!(ultravox_call_id, event = %event.event, "No call for Ultravox event");
    }
    Ok(call)
}

async fn call_started(state: &AppState, event: &UltravoxEvent) -> Result<Outcome, ApiError> {
    let Some(mut call) = find_call(state, event).await? else {
        return Ok(Outcome::NoMatch);
    };
    if call.status.is_terminal() || call.status == CallStatus::InProgress {
        return Ok(Outcome::Duplicate);
    }

    call.transition(CallStatus::InProgress);
    call.started_at = Some(event_time(event));
    state.store.update_call(&call).await?;

    settle_contact(state, &call, ContactStatus::Calling).await?;

    tracing::info!(call_id = %call.id, "Call started");
    state
        .publish(DomainEvent::new(
            EventType::CallStarted,
            call.tenant_id,
            json!({
                "call_id": call.id,
                "ultravox_call_id": call.ultravox_call_id,
                "started_at": call.started_at,
            }),
        ))
        .await;
    Ok(Outcome::Applied)
}

async fn call_completed(state: &AppState, event: &UltravoxEvent) -> Result<Outcome, ApiError> {
    let duration_seconds = call_duration_seconds(event.data.duration_seconds)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let Some(mut call) = find_call(state, event).await? else {
        return Ok(Outcome::NoMatch);
    };

    let credits = billed_minutes(duration_seconds);

    let entry = CreditLedgerEntry::spent(
        call.tenant_id,
        credits,
        ReferenceType::Call,
        call.id.to_string(),
        format!("Call duration: {credits} minutes"),
    )?;
    let outcome = state.store.apply_ledger_entry(&entry).await?;

    if call.status != CallStatus::Completed && call.transition(CallStatus::Completed) {
        call.duration_seconds = Some(duration_seconds);
        call.cost_usd = event.data.cost_usd;
        call.recording_url.clone_from(&event.data.recording_url);
        call.ended_at = Some(event_time(event));
        state.store.update_call(&call).await?;
    }

    settle_contact(state, &call, ContactStatus::Completed).await?;

    let LedgerOutcome::Applied { balance } = outcome else {
        tracing::info!(call_id = %call.id, "Call completion already billed");
        return Ok(Outcome::Duplicate);
    };

    tracing::info!(
        call_id = %call.id,
        tenant_id = %call.tenant_id,
        duration_seconds,
        credits,
        balance,
        "Call completed and billed"
    );
    state
        .publish(DomainEvent::new(
            EventType::CallCompleted,
            call.tenant_id,
            json!({
                "call_id": call.id,
                "ultravox_call_id": call.ultravox_call_id,
                "duration_seconds": duration_seconds,
                "cost_usd": call.cost_usd,
                "credits_billed": credits,
                "recording_url": call.recording_url,
            }),
        ))
        .await;
    Ok(Outcome::Applied)
}

async fn call_failed(state: &AppState, event: &UltravoxEvent) -> Result<Outcome, ApiError> {
    let Some(mut call) = find_call(state, event).await? else {
        return Ok(Outcome::NoMatch);
    };
    if call.status.is_terminal() {
        return Ok(Outcome::Duplicate);
    }

    let error_message = event
        .data
        .error_message
        .clone()
        .or_else(|| event.error_message.clone())
        .unwrap_or_else(|| "Call failed".to_string());

    call.transition(CallStatus::Failed);
    call.error_message = Some(error_message.clone());
    call.ended_at = Some(event_time(event));
    state.store.update_call(&call).await?;

    settle_contact(state, &call, ContactStatus::Failed).await?;

    tracing::info!(call_id = %call.id, error = %error_message, "Call failed");
    state
        .publish(DomainEvent::new(
            EventType::CallFailed,
            call.tenant_id,
            json!({
                "call_id": call.id,
                "ultravox_call_id": call.ultravox_call_id,
                "error_message": error_message,
            }),
        ))
        .await;
    Ok(Outcome::Applied)
}

/// Move the call's campaign contact to `status` and refresh the campaign.
async fn settle_contact(state: &AppState, call: &Call, status: ContactStatus) -> Result<(), ApiError> {
    let Some(campaign_id) = call.campaign_id() else {
        return Ok(());
    };
    let updated = state
        .store
        .set_contact_status(campaign_id, &call.phone_number, status, Some(call.id))
        .await?;
    if updated {
        refresh_campaign(state, campaign_id).await?;
    }
    Ok(())
}

/// Recount a campaign's contacts and advance its status to match: `active`
/// once dialling has begun, `completed` once every contact has settled.
/// Returns `None` if the campaign doesn't exist.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn refresh_campaign(
    state: &AppState,
    campaign_id: CampaignId,
) -> Result<Option<CampaignStats>, ApiError> {
    let Some(stats) = state.store.recompute_campaign_stats(campaign_id).await? else {
        return Ok(None);
    };
    tracing::debug!(campaign_id = %campaign_id, ?stats, "Campaign stats recomputed");

    let Some(mut campaign) = state.store.find_campaign(campaign_id).await? else {
        return Ok(Some(stats));
    };
    if let Some(next) = campaign.status.progressed(&stats) {
        let previous = campaign.status;
        campaign.status = next;
        campaign.updated_at = Utc::now();
        state.store.update_campaign(&campaign).await?;
        tracing::info!(
            campaign_id = %campaign_id,
            from = %previous,
            to = %next,
            "Campaign status advanced"
        );
    }
    Ok(Some(stats))
}

async fn voice_training(
    state: &AppState,
    event: &UltravoxEvent,
    event_type: EventType,
) -> Result<Outcome, ApiError> {
    let Some(ultravox_voice_id) = event.voice_id.as_deref() else {
        tracing::warn!(event = %event.event, "Voice event without voice_id");
        return Ok(Outcome::NoMatch);
    };
    let Some(mut voice) = state.store.find_voice_by_ultravox_id(ultravox_voice_id).await? else {
        tracing::warn!(ultravox_voice_id, "No voice for Ultravox event");
        return Ok(Outcome::NoMatch);
    };

    let at = event_time(event);
    let data = if event_type == EventType::VoiceTrainingCompleted {
        if voice.status == VoiceStatus::Active {
            return Ok(Outcome::Duplicate);
        }
        voice.complete_training(at);
        json!({ "voice_id": voice.id, "ultravox_voice_id": ultravox_voice_id })
    } else {
        if voice.status == VoiceStatus::Failed {
            return Ok(Outcome::Duplicate);
        }
        let error_message = event
            .error_message
            .as_deref()
            .or(event.data.error_message.as_deref())
            .unwrap_or("Voice training failed");
        voice.fail_training(error_message, at);
        json!({
            "voice_id": voice.id,
            "ultravox_voice_id": ultravox_voice_id,
            "error_message": error_message,
        })
    };
    state.store.update_voice(&voice).await?;

    tracing::info!(voice_id = %voice.id, status = %voice.status, "Voice training finished");
    state
        .publish(DomainEvent::new(event_type, voice.tenant_id, data))
        .await;
    Ok(Outcome::Applied)
}

// ============================================================================
// Stripe
// ============================================================================

/// Apply a Stripe event.
pub async fn apply_stripe(state: &AppState, event: StripeEvent) -> Result<Outcome, ApiError> {
    match event.event_type.as_str() {
        "payment_intent.succeeded" => payment_succeeded(state, &event).await,
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted" => subscription_changed(state, &event).await,
        other => {
            tracing::info!(event_id = %event.id, event_type = other, "Ignoring unhandled Stripe event");
            Ok(Outcome::Ignored)
        }
    }
}

async fn payment_succeeded(state: &AppState, event: &StripeEvent) -> Result<Outcome, ApiError> {
    let object = &event.data.object;
    let intent_id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("payment intent without id".into()))?;
    let amount_cents = object.get("amount").and_then(Value::as_i64).unwrap_or(0);

    let Some(tenant_id) = object
        .pointer("/metadata/client_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<TenantId>().ok())
    else {
        tracing::warn!(payment_intent = intent_id, "Payment intent without a valid client_id");
        return Ok(Outcome::NoMatch);
    };

    let credits = credits_for_cents(amount_cents);
    if credits <= 0 {
        tracing::warn!(payment_intent = intent_id, amount_cents, "Payment too small to credit");
        return Ok(Outcome::Ignored);
    }
    if state.store.get_tenant(tenant_id).await?.is_none() {
        tracing::warn!(payment_intent = intent_id, tenant_id = %tenant_id, "Payment for unknown tenant");
        return Ok(Outcome::NoMatch);
    }

    let entry = CreditLedgerEntry::purchased(
        tenant_id,
        credits,
        ReferenceType::StripePayment,
        intent_id,
        format!("Stripe payment: {intent_id}"),
    )?;
    let LedgerOutcome::Applied { balance } = state.store.apply_ledger_entry(&entry).await? else {
        tracing::info!(payment_intent = intent_id, "Payment already credited");
        return Ok(Outcome::Duplicate);
    };

    tracing::info!(
        tenant_id = %tenant_id,
        payment_intent = intent_id,
        credits,
        balance,
        "Credits purchased"
    );
    #[allow(clippy::cast_precision_loss)]
    let amount_usd = amount_cents as f64 / 100.0;
    state
        .publish(DomainEvent::new(
            EventType::CreditsPurchased,
            tenant_id,
            json!({
                "amount_usd": amount_usd,
                "credits": credits,
                "transaction_id": intent_id,
            }),
        ))
        .await;
    Ok(Outcome::Applied)
}

async fn subscription_changed(state: &AppState, event: &StripeEvent) -> Result<Outcome, ApiError> {
    let object = &event.data.object;
    let Some(customer) = object.get("customer").and_then(Value::as_str) else {
        tracing::warn!(event_id = %event.id, "Subscription event without customer");
        return Ok(Outcome::NoMatch);
    };
    let Some(tenant) = state.store.find_tenant_by_stripe_customer(customer).await? else {
        tracing::warn!(customer, "No tenant for Stripe customer");
        return Ok(Outcome::NoMatch);
    };

    let stripe_status = object.get("status").and_then(Value::as_str).unwrap_or_default();
    let (status, mapped) = SubscriptionStatus::from_stripe_or_active(stripe_status);
    if !mapped {
        tracing::warn!(
            tenant_id = %tenant.id,
            stripe_status,
            "Unmapped Stripe subscription status - treating as active"
        );
    }
    if tenant.subscription_status == status {
        return Ok(Outcome::Duplicate);
    }

    state.store.update_subscription_status(tenant.id, status).await?;
    tracing::info!(tenant_id = %tenant.id, status = %status, "Subscription status updated");
    Ok(Outcome::Applied)
}
