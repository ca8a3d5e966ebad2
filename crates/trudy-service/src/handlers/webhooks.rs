//! Webhook handlers for Ultravox and Stripe.
//!
//! Signatures are checked against the raw body before it is decoded, and
//! nothing is read from or written to the store until they pass.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;
use crate::webhooks::reconciler::{self, Outcome, StripeEvent, UltravoxEvent};
use crate::webhooks::signature::{
    verify_stripe, verify_ultravox, SignatureError, STRIPE_SIGNATURE_HEADER,
    ULTRAVOX_SIGNATURE_HEADER, ULTRAVOX_TIMESTAMP_HEADER,
};

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was accepted.
    pub received: bool,
    /// What the delivery did.
    pub outcome: &'static str,
}

impl From<Outcome> for WebhookResponse {
    fn from(outcome: Outcome) -> Self {
        Self {
            received: true,
            outcome: outcome.as_str(),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn rejected(source: &str, error: &SignatureError) -> ApiError {
    if matches!(error, SignatureError::MissingSecret) {
        tracing::error!(source, "Webhook secret not configured - rejecting delivery");
    } else {
        tracing::warn!(source, error = %error, "Invalid webhook signature");
    }
    ApiError::Unauthorized("Invalid webhook signature".into())
}

/// Handle Ultravox call and voice events.
pub async fn ultravox_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    verify_ultravox(
        state.config.ultravox_webhook_secret.as_deref(),
        header(&headers, ULTRAVOX_SIGNATURE_HEADER),
        header(&headers, ULTRAVOX_TIMESTAMP_HEADER),
        &body,
        state.config.webhook_max_age_seconds,
        Utc::now().timestamp(),
    )
    .map_err(|e| rejected("ultravox", &e))?;

    let event: UltravoxEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid webhook payload: {e}")))?;

    tracing::info!(
        event = %event.event,
        call_id = ?event.call_id,
        voice_id = ?event.voice_id,
        "Received Ultravox webhook"
    );

    let outcome = reconciler::apply_ultravox(&state, event).await?;
    Ok(Json(outcome.into()))
}

/// Handle Stripe payment and subscription events.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    verify_stripe(
        state.config.stripe_webhook_secret.as_deref(),
        header(&headers, STRIPE_SIGNATURE_HEADER),
        &body,
        state.config.webhook_max_age_seconds,
        Utc::now().timestamp(),
    )
    .map_err(|e| rejected("stripe", &e))?;

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid webhook payload: {e}")))?;

    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        "Received Stripe webhook"
    );

    let outcome = reconciler::apply_stripe(&state, event).await?;
    Ok(Json(outcome.into()))
}
