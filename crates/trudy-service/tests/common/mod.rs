//! Shared harness for the service integration tests.
//!
//! Each harness runs the full router over an in-memory store, with Ultravox
//! pointed at a wiremock server and bearer tokens signed with a shared HS256
//! secret.

#![allow(dead_code)]

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use axum_test::{TestRequest, TestServer};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use trudy_core::{
    Agent, AgentId, AgentStatus, CreditLedgerEntry, ReferenceType, Tenant, TenantId, Voice,
    VoiceId, VoiceStatus,
};
use trudy_service::auth::JwtClaims;
use trudy_service::crypto::sign_webhook;
use trudy_service::{create_router, AppState, EgressMode, MemoryEventBus, ServiceConfig};
use trudy_store::{MemoryStore, Store};

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const ISSUER: &str = "https://auth.test";
pub const AUDIENCE: &str = "trudy-api";
pub const INTERNAL_KEY: &str = "test-internal-key";
pub const ULTRAVOX_SECRET: &str = "uv-webhook-secret";
pub const STRIPE_SECRET: &str = "whsec_test";

/// A running service plus handles on everything behind it.
pub struct TestHarness {
    pub server: TestServer,
    pub store: Arc<MemoryStore>,
    pub events: Arc<MemoryEventBus>,
    pub ultravox: MockServer,
    pub tenant_id: TenantId,
}

pub fn test_config(ultravox_url: &str) -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        auth_issuer: ISSUER.into(),
        auth_audience: AUDIENCE.into(),
        auth_hs256_secret: Some(JWT_SECRET.into()),
        internal_api_key: Some(INTERNAL_KEY.into()),
        ultravox_base_url: ultravox_url.into(),
        ultravox_api_key: "uv_test_key".into(),
        ultravox_webhook_secret: Some(ULTRAVOX_SECRET.into()),
        stripe_webhook_secret: Some(STRIPE_SECRET.into()),
        egress_mode: EgressMode::Inline,
        egress_timeout_seconds: 2,
        provider_max_attempts: 1,
        rate_limit_enabled: false,
        ..ServiceConfig::default()
    }
}

impl TestHarness {
    /// A harness with one tenant holding `credits` credits.
    pub async fn with_credits(credits: i64) -> Self {
        Self::build(credits, |_| {}).await
    }

    /// A harness whose test configuration is adjusted by `configure`.
    pub async fn with_config(configure: impl FnOnce(&mut ServiceConfig)) -> Self {
        Self::build(100, configure).await
    }

    async fn build(credits: i64, configure: impl FnOnce(&mut ServiceConfig)) -> Self {
        let ultravox = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventBus::new());

        let mut config = test_config(&ultravox.uri());
        configure(&mut config);
        let state = AppState::with_event_bus(store.clone(), config, events.clone())
            .expect("Failed to build app state");
        let server = TestServer::new(create_router(state)).expect("Failed to create test server");

        let tenant_id = TenantId::generate();
        store
            .insert_tenant(&Tenant::new(tenant_id, "Acme Dental"))
            .await
            .unwrap();
        if credits > 0 {
            let entry = CreditLedgerEntry::purchased(
                tenant_id,
                credits,
                ReferenceType::StripePayment,
                format!("pi_seed_{tenant_id}"),
                "Seed credits",
            )
            .unwrap();
            store.apply_ledger_entry(&entry).await.unwrap();
        }

        Self {
            server,
            store,
            events,
            ultravox,
            tenant_id,
        }
    }

    pub async fn new() -> Self {
        Self::with_credits(100).await
    }

    /// A bearer token for `role` in this harness's tenant.
    pub fn token(&self, role: &str) -> String {
        token_for(self.tenant_id, role)
    }

    /// Authenticate `request` as a client admin.
    pub fn admin(&self, request: TestRequest) -> TestRequest {
        self.as_role(request, "client_admin")
    }

    /// Authenticate `request` as a plain client user.
    pub fn user(&self, request: TestRequest) -> TestRequest {
        self.as_role(request, "client_user")
    }

    pub fn as_role(&self, request: TestRequest, role: &str) -> TestRequest {
        request
            .add_header(
                HeaderName::from_static("authorization"),
                header_value(&format!("Bearer {}", self.token(role))),
            )
            .add_header(
                HeaderName::from_static("x-client-id"),
                header_value(&self.tenant_id.to_string()),
            )
    }

    /// Authenticate `request` with the operator key.
    pub fn internal(&self, request: TestRequest) -> TestRequest {
        request.add_header(
            HeaderName::from_static("x-internal-key"),
            HeaderValue::from_static(INTERNAL_KEY),
        )
    }

    pub async fn balance(&self) -> i64 {
        self.store
            .get_tenant(self.tenant_id)
            .await
            .unwrap()
            .unwrap()
            .credits_balance
    }

    /// Seed an active voice.
    pub async fn seed_voice(&self) -> Voice {
        let now = Utc::now();
        let voice = Voice {
            id: VoiceId::generate(),
            tenant_id: self.tenant_id,
            name: "Front desk".into(),
            provider: "elevenlabs".into(),
            voice_type: "reference".into(),
            language: "en-US".into(),
            status: VoiceStatus::Active,
            training_info: json!({}),
            ultravox_voice_id: Some(format!("uv-voice-{}", VoiceId::generate())),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_voice(&voice).await.unwrap();
        voice
    }

    /// Seed an active agent (and the voice it speaks with).
    pub async fn seed_agent(&self) -> Agent {
        let voice = self.seed_voice().await;
        let now = Utc::now();
        let agent = Agent {
            id: AgentId::generate(),
            tenant_id: self.tenant_id,
            ultravox_agent_id: Some("uv-agent-1".into()),
            name: "Receptionist".into(),
            description: None,
            voice_id: voice.id,
            system_prompt: "You answer the phone for a dental clinic.".into(),
            model: "fixie-ai/ultravox-v0_4-8k".into(),
            tools: Vec::new(),
            knowledge_bases: Vec::new(),
            status: AgentStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_agent(&agent).await.unwrap();
        agent
    }

    /// Make Ultravox accept `POST {route}` with the given provider ID.
    pub async fn mock_create(&self, route: &str, id: &str) {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": id })))
            .mount(&self.ultravox)
            .await;
    }

    /// POST a signed Ultravox webhook.
    pub async fn ultravox_webhook(&self, body: &serde_json::Value) -> axum_test::TestResponse {
        let body = body.to_string();
        let timestamp = Utc::now().timestamp();
        let signature = sign_webhook(ULTRAVOX_SECRET, timestamp, &body);
        self.server
            .post("/webhooks/ultravox")
            .add_header(
                HeaderName::from_static("x-ultravox-signature"),
                header_value(&signature),
            )
            .add_header(
                HeaderName::from_static("x-ultravox-timestamp"),
                header_value(&timestamp.to_string()),
            )
            .bytes(body.into())
            .await
    }

    /// POST a signed Stripe webhook.
    pub async fn stripe_webhook(&self, body: &serde_json::Value) -> axum_test::TestResponse {
        let body = body.to_string();
        let timestamp = Utc::now().timestamp();
        let signature = sign_webhook(STRIPE_SECRET, timestamp, &body);
        self.server
            .post("/webhooks/stripe")
            .add_header(
                HeaderName::from_static("stripe-signature"),
                header_value(&format!("t={timestamp},v1={signature}")),
            )
            .bytes(body.into())
            .await
    }
}

/// A bearer token for `role` in `tenant_id`.
pub fn token_for(tenant_id: TenantId, role: &str) -> String {
    let claims = JwtClaims {
        sub: "user-1".into(),
        client_id: Some(tenant_id.to_string()),
        role: Some(role.into()),
        aud: Some(json!(AUDIENCE)),
        iss: ISSUER.into(),
        exp: Utc::now().timestamp() + 3600,
        iat: Some(Utc::now().timestamp()),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap()
}
