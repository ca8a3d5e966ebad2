//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    agents, api_keys, audit_logs, calls, campaigns, credits, health, internal, knowledge_bases,
    tools, voices, webhook_endpoints, webhooks,
};
use crate::idempotency;
use crate::rate_limit;
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for tenant API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Maximum concurrent requests for operator endpoints.
const INTERNAL_MAX_CONCURRENT_REQUESTS: usize = 4;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Tenant API (JWT auth, per-client rate limit; creation routes honour
/// `X-Idempotency-Key`)
/// - `POST /v1/calls`, `GET /v1/calls`, `GET /v1/calls/:id`
/// - `POST /v1/campaigns`, `GET /v1/campaigns`, `GET|PATCH|DELETE /v1/campaigns/:id`
/// - `POST /v1/campaigns/:id/contacts`, `POST /v1/campaigns/:id/schedule`
/// - `POST /v1/agents`, `GET /v1/agents`, `GET|PATCH /v1/agents/:id`
/// - `POST /v1/voices`, `GET /v1/voices`, `GET /v1/voices/:id`
/// - `POST /v1/knowledge-bases`, `GET /v1/knowledge-bases`, `GET /v1/knowledge-bases/:id`
/// - `POST /v1/tools`, `GET /v1/tools`, `GET|PATCH|DELETE /v1/tools/:id`
/// - `GET /v1/credits/balance`, `GET /v1/credits/ledger`
/// - `POST /v1/webhook-endpoints`, `GET /v1/webhook-endpoints`,
///   `GET|PATCH|DELETE /v1/webhook-endpoints/:id`
/// - `POST /v1/api-keys`, `GET /v1/api-keys`, `PATCH /v1/providers/tts`
/// - `GET /v1/audit-logs`
///
/// ## Webhooks (signature verification)
/// - `POST /webhooks/ultravox` - Call and voice lifecycle events
/// - `POST /webhooks/stripe` - Payments and subscriptions
///
/// ## Operator (`X-Internal-Key`)
/// - `POST /internal/idempotency/cleanup`
/// - `POST /internal/campaigns/:id/update-stats`
/// - `POST /internal/voices/:id/update-status`
/// - `POST /internal/webhook-deliveries/retry`
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);
    let idempotent = || middleware::from_fn_with_state(state.clone(), idempotency::guard);

    let api_routes = Router::new()
        // Calls
        .route(
            "/calls",
            post(calls::create_call).route_layer(idempotent()),
        )
        .route("/calls", get(calls::list_calls))
        .route("/calls/:id", get(calls::get_call))
        // Campaigns
        .route(
            "/campaigns",
            post(campaigns::create_campaign).route_layer(idempotent()),
        )
        .route("/campaigns", get(campaigns::list_campaigns))
        .route("/campaigns/:id", get(campaigns::get_campaign))
        .route("/campaigns/:id", patch(campaigns::update_campaign))
        .route("/campaigns/:id", delete(campaigns::delete_campaign))
        .route("/campaigns/:id/contacts", post(campaigns::upload_contacts))
        .route("/campaigns/:id/schedule", post(campaigns::schedule_campaign))
        // Agents
        .route(
            "/agents",
            post(agents::create_agent).route_layer(idempotent()),
        )
        .route("/agents", get(agents::list_agents))
        .route("/agents/:id", get(agents::get_agent))
        .route("/agents/:id", patch(agents::update_agent))
        // Voices
        .route(
            "/voices",
            post(voices::create_voice).route_layer(idempotent()),
        )
        .route("/voices", get(voices::list_voices))
        .route("/voices/:id", get(voices::get_voice))
        // Knowledge bases
        .route(
            "/knowledge-bases",
            post(knowledge_bases::create_knowledge_base).route_layer(idempotent()),
        )
        .route(
            "/knowledge-bases",
            get(knowledge_bases::list_knowledge_bases),
        )
        .route(
            "/knowledge-bases/:id",
            get(knowledge_bases::get_knowledge_base),
        )
        // Tools
        .route("/tools", post(tools::create_tool).route_layer(idempotent()))
        .route("/tools", get(tools::list_tools))
        .route("/tools/:id", get(tools::get_tool))
        .route("/tools/:id", patch(tools::update_tool))
        .route("/tools/:id", delete(tools::delete_tool))
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/ledger", get(credits::list_ledger))
        // Egress webhook endpoints
        .route(
            "/webhook-endpoints",
            post(webhook_endpoints::create_endpoint),
        )
        .route("/webhook-endpoints", get(webhook_endpoints::list_endpoints))
        .route(
            "/webhook-endpoints/:id",
            get(webhook_endpoints::get_endpoint),
        )
        .route(
            "/webhook-endpoints/:id",
            patch(webhook_endpoints::update_endpoint),
        )
        .route(
            "/webhook-endpoints/:id",
            delete(webhook_endpoints::delete_endpoint),
        )
        // API keys
        .route("/api-keys", post(api_keys::create_api_key))
        .route("/api-keys", get(api_keys::list_api_keys))
        .route("/providers/tts", patch(api_keys::update_tts_provider))
        // Audit log
        .route("/audit-logs", get(audit_logs::list_audit_logs))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::enforce,
        ));

    let internal_routes = Router::new()
        .route(
            "/idempotency/cleanup",
            post(internal::cleanup_idempotency),
        )
        .route(
            "/campaigns/:id/update-stats",
            post(internal::update_campaign_stats),
        )
        .route(
            "/voices/:id/update-status",
            post(internal::update_voice_status),
        )
        .route(
            "/webhook-deliveries/retry",
            post(internal::retry_webhook_deliveries),
        )
        .layer(ConcurrencyLimitLayer::new(INTERNAL_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Operator routes
        .nest("/internal", internal_routes)
        // Webhooks (no rate limit - controlled by external services)
        .route("/webhooks/ultravox", post(webhooks::ultravox_webhook))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

