//! API error types and responses.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ultravox::UltravoxError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Forbidden - valid credentials but insufficient permissions.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - malformed input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Well-formed input that fails a business rule.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Conflict - invalid state transition or duplicate.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An idempotency key was replayed with a different request.
    #[error("idempotency key reused with a different request")]
    IdempotencyKeyReused,

    /// Insufficient credits.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// The provider kept answering 429.
    #[error("rate limited by provider")]
    RateLimited {
        /// Seconds the provider asked us to wait.
        retry_after: Option<u64>,
    },

    /// This client sent too many requests in the current window.
    #[error("rate limit exceeded")]
    RateLimitExceeded {
        /// Requests allowed per window.
        limit: u32,
        /// When the next window opens.
        reset_at: DateTime<Utc>,
    },

    /// The provider failed.
    #[error("provider error: {0}")]
    Provider(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) | Self::IdempotencyKeyReused => StatusCode::CONFLICT,
            Self::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::RateLimited { .. } | Self::RateLimitExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Shorthand for a missing resource of `kind`.
    #[must_use]
    pub fn not_found(kind: &str) -> Self {
        Self::NotFound(format!("{kind} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message, details) = match &self {
            Self::Unauthorized(msg) => ("unauthorized", msg.clone(), None),
            Self::Forbidden(msg) => ("forbidden", msg.clone(), None),
            Self::NotFound(msg) => ("not_found", msg.clone(), None),
            Self::BadRequest(msg) => ("bad_request", msg.clone(), None),
            Self::Validation(msg) => ("validation_error", msg.clone(), None),
            Self::Conflict(msg) => ("conflict", msg.clone(), None),
            Self::IdempotencyKeyReused => (
                "idempotency_key_reused",
                "Idempotency key was already used with a different request".to_string(),
                None,
            ),
            Self::InsufficientCredits { balance, required } => (
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance,
                    "required": required
                })),
            ),
            Self::RateLimited { retry_after } => (
                "rate_limited",
                "Provider rate limit exceeded".to_string(),
                retry_after.map(|s| serde_json::json!({ "retry_after": s })),
            ),
            Self::RateLimitExceeded { limit, reset_at } => (
                "rate_limit_exceeded",
                "Rate limit exceeded".to_string(),
                Some(serde_json::json!({
                    "limit": limit,
                    "reset_at": reset_at,
                })),
            ),
            Self::Provider(msg) => {
                tracing::warn!(error = %msg, "Provider error");
                ("provider_error", msg.clone(), None)
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        let retry_after = match self {
            Self::RateLimited { retry_after } => retry_after,
            Self::RateLimitExceeded { reset_at, .. } => {
                u64::try_from((reset_at - Utc::now()).num_seconds().max(1)).ok()
            }
            _ => None,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<trudy_store::StoreError> for ApiError {
    fn from(err: trudy_store::StoreError) -> Self {
        match err {
            trudy_store::StoreError::NotFound => Self::NotFound("resource not found".into()),
            trudy_store::StoreError::Conflict(msg) => Self::Conflict(msg),
            trudy_store::StoreError::Database(msg)
            | trudy_store::StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

impl From<UltravoxError> for ApiError {
    fn from(err: UltravoxError) -> Self {
        match err {
            UltravoxError::Api {
                status: 429,
                retry_after,
                ..
            } => Self::RateLimited { retry_after },
            other => Self::Provider(other.to_string()),
        }
    }
}

impl From<trudy_core::DomainError> for ApiError {
    fn from(err: trudy_core::DomainError) -> Self {
        match err {
            trudy_core::DomainError::InvalidAmount(_) => Self::Internal(err.to_string()),
            other => Self::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(ApiError::Validation(String::new()).status(), 422);
        assert_eq!(ApiError::IdempotencyKeyReused.status(), 409);
        assert_eq!(
            ApiError::InsufficientCredits {
                balance: 0,
                required: 1
            }
            .status(),
            402
        );
        assert_eq!(ApiError::Provider(String::new()).status(), 502);
        assert_eq!(ApiError::RateLimited { retry_after: None }.status(), 429);
    }

    #[test]
    fn provider_rate_limit_maps_to_429() {
        let err = ApiError::from(UltravoxError::Api {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(3),
        });
        assert!(matches!(err, ApiError::RateLimited { retry_after: Some(3) }));

        let err = ApiError::from(UltravoxError::Api {
            status: 500,
            message: "boom".into(),
            retry_after: None,
        });
        assert!(matches!(err, ApiError::Provider(_)));
    }

    #[test]
    fn own_rate_limit_reports_limit_and_reset() {
        let reset_at = Utc::now() + chrono::Duration::seconds(30);
        let response = ApiError::RateLimitExceeded {
            limit: 100,
            reset_at,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=30).contains(&retry_after));
    }

    #[test]
    fn store_not_found_maps_to_404() {
        let err = ApiError::from(trudy_store::StoreError::NotFound);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
