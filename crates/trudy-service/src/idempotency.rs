//! Idempotency guard for creation endpoints.
//!
//! Requests carrying `X-Idempotency-Key` are fingerprinted. A replay of the
//! same request gets the first 2xx response back verbatim without reaching
//! the handler; a different request under the same key is rejected with 409.
//! Requests without the header pass straight through.

use std::sync::Arc;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use trudy_core::{CachedResponse, CanonicalRequest, IdempotencyCheck, IdempotencyRecord};
use trudy_store::IdempotencyInsert;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Request header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Response header set on replayed responses.
pub const REPLAYED_HEADER: &str = "x-idempotent-replayed";

const MAX_KEY_LEN: usize = 255;

/// Middleware applied to the creation routes.
pub async fn guard(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some(key) = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
    else {
        return next.run(request).await;
    };
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return ApiError::BadRequest(format!(
            "X-Idempotency-Key must be 1-{MAX_KEY_LEN} characters"
        ))
        .into_response();
    }

    let (mut parts, body) = request.into_parts();
    let user = match AuthUser::from_request_parts(&mut parts, &state).await {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    let Ok(bytes) = to_bytes(body, state.config.max_body_bytes).await else {
        return ApiError::BadRequest("Request body too large".into()).into_response();
    };

    let fingerprint = canonical_request(&parts, &bytes).fingerprint();
    let now = Utc::now();

    match state.store.get_idempotency_record(user.tenant_id, &key).await {
        Ok(existing) => match IdempotencyRecord::check(existing.as_ref(), &fingerprint, now) {
            IdempotencyCheck::Hit(cached) => {
                tracing::info!(tenant_id = %user.tenant_id, key = %key, "Idempotency key hit");
                return replay(&cached);
            }
            IdempotencyCheck::Conflict => {
                tracing::warn!(tenant_id = %user.tenant_id, key = %key, "Idempotency key reused");
                return ApiError::IdempotencyKeyReused.into_response();
            }
            IdempotencyCheck::Miss => {}
        },
        Err(e) if state.config.idempotency_fail_open => {
            tracing::warn!(error = %e, key = %key, "Idempotency lookup failed - continuing");
        }
        Err(e) => {
            return ApiError::Internal(format!("idempotency lookup failed: {e}")).into_response();
        }
    }

    let response = next
        .run(Request::from_parts(parts, Body::from(bytes)))
        .await;
    if !response.status().is_success() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return ApiError::Internal(format!("failed to buffer response: {e}")).into_response();
        }
    };

    let record = IdempotencyRecord::new(
        user.tenant_id,
        key,
        fingerprint,
        CachedResponse {
            status_code: parts.status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        },
        state.config.idempotency_ttl_days,
        now,
    );

    match state.store.insert_idempotency_record(&record).await {
        Ok(IdempotencyInsert::Inserted) => {
            tracing::debug!(
                tenant_id = %record.tenant_id,
                key = %record.key,
                status_code = record.response.status_code,
                "Stored idempotency key"
            );
        }
        Ok(IdempotencyInsert::Exists(winner))
            if winner.request_fingerprint == record.request_fingerprint =>
        {
            tracing::info!(key = %record.key, "Lost idempotency race - returning stored response");
            return replay(&winner.response);
        }
        Ok(IdempotencyInsert::Exists(_)) => {
            tracing::warn!(key = %record.key, "Idempotency key taken by a different request");
        }
        Err(e) => {
            tracing::error!(error = %e, key = %record.key, "Failed to store idempotency key");
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

/// Build the fingerprint input from a buffered request.
fn canonical_request(parts: &Parts, body: &Bytes) -> CanonicalRequest {
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let body = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
        })
    };

    CanonicalRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        headers,
        body,
    }
}

fn replay(cached: &CachedResponse) -> Response {
    let status = StatusCode::from_u16(cached.status_code).unwrap_or(StatusCode::OK);
    let mut response = (status, cached.body.clone()).into_response();
    let headers = response.headers_mut();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}
