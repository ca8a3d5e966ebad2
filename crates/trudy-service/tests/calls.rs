//! Call creation, listing and authentication tests.

mod common;

use axum::http::{HeaderName, StatusCode};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use common::{header_value, token_for, TestHarness};
use trudy_core::{EventType, TenantId};

fn outbound(agent_id: impl std::fmt::Display) -> Value {
    json!({
        "agent_id": agent_id.to_string(),
        "phone_number": "+14155550100",
        "direction": "outbound",
    })
}

#[tokio::test]
async fn outbound_call_is_created_and_handed_to_ultravox() {
    let h = TestHarness::new().await;
    let agent = h.seed_agent().await;
    h.mock_create("/calls", "uv-call-1").await;

    let response = h
        .user(h.server.post("/v1/calls"))
        .json(&outbound(agent.id))
        .await;

    assert_eq!(response.status_code(), StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["data"]["status"], "queued");
    assert_eq!(body["data"]["ultravox_call_id"], "uv-call-1");
    assert_eq!(body["data"]["client_id"], h.tenant_id.to_string());
    assert!(body["meta"]["request_id"].is_string());

    let events = h.events.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::CallCreated);
}

#[tokio::test]
async fn outbound_call_without_credits_is_rejected() {
    let h = TestHarness::with_credits(0).await;
    let agent = h.seed_agent().await;

    let response = h
        .user(h.server.post("/v1/calls"))
        .json(&outbound(agent.id))
        .await;

    assert_eq!(response.status_code(), StatusCode::PAYMENT_REQUIRED);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "insufficient_credits");
    assert_eq!(body["error"]["details"]["balance"], 0);
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn inbound_call_needs_no_credits() {
    let h = TestHarness::with_credits(0).await;
    let agent = h.seed_agent().await;
    h.mock_create("/calls", "uv-call-in").await;

    let mut body = outbound(agent.id);
    body["direction"] = json!("inbound");
    let response = h.user(h.server.post("/v1/calls")).json(&body).await;

    assert_eq!(response.status_code(), StatusCode::CREATED);
}

#[tokio::test]
async fn malformed_phone_number_is_a_validation_error() {
    let h = TestHarness::new().await;
    let agent = h.seed_agent().await;

    let mut body = outbound(agent.id);
    body["phone_number"] = json!("555-0100");
    let response = h.user(h.server.post("/v1/calls")).json(&body).await;

    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn unknown_agent_is_not_found() {
    let h = TestHarness::new().await;

    let response = h
        .user(h.server.post("/v1/calls"))
        .json(&outbound(uuid::Uuid::new_v4()))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn provider_rejection_marks_the_call_failed() {
    let h = TestHarness::new().await;
    let agent = h.seed_agent().await;
    Mock::given(method("POST"))
        .and(path("/calls"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"detail": "bad number"})))
        .mount(&h.ultravox)
        .await;

    let response = h
        .user(h.server.post("/v1/calls"))
        .json(&outbound(agent.id))
        .await;
    assert!(response.status_code().is_client_error() || response.status_code().is_server_error());

    let listed: Value = h.user(h.server.get("/v1/calls")).await.json();
    assert_eq!(listed["data"][0]["status"], "failed");
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn calls_can_be_listed_filtered_and_fetched() {
    let h = TestHarness::new().await;
    let agent = h.seed_agent().await;
    h.mock_create("/calls", "uv-call-2").await;

    let created: Value = h
        .user(h.server.post("/v1/calls"))
        .json(&outbound(agent.id))
        .await
        .json();
    let call_id = created["data"]["id"].as_str().unwrap().to_string();

    let listed: Value = h
        .user(h.server.get("/v1/calls"))
        .add_query_param("direction", "outbound")
        .await
        .json();
    assert_eq!(listed["pagination"]["total"], 1);
    assert_eq!(listed["data"][0]["id"], call_id.as_str());

    let none: Value = h
        .user(h.server.get("/v1/calls"))
        .add_query_param("status", "completed")
        .await
        .json();
    assert_eq!(none["pagination"]["total"], 0);

    let fetched = h.user(h.server.get(&format!("/v1/calls/{call_id}"))).await;
    assert_eq!(fetched.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn calls_are_scoped_to_their_tenant() {
    let h = TestHarness::new().await;
    let agent = h.seed_agent().await;
    h.mock_create("/calls", "uv-call-3").await;

    let created: Value = h
        .user(h.server.post("/v1/calls"))
        .json(&outbound(agent.id))
        .await
        .json();
    let call_id = created["data"]["id"].as_str().unwrap().to_string();

    let other = TenantId::generate();
    let response = h
        .server
        .get(&format!("/v1/calls/{call_id}"))
        .add_header(
            HeaderName::from_static("authorization"),
            header_value(&format!("Bearer {}", token_for(other, "client_user"))),
        )
        .add_header(
            HeaderName::from_static("x-client-id"),
            header_value(&other.to_string()),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn requests_without_a_valid_token_are_unauthorized() {
    let h = TestHarness::new().await;

    let response = h.server.get("/v1/calls").await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

    let response = h
        .server
        .get("/v1/calls")
        .add_header(
            HeaderName::from_static("authorization"),
            header_value("Bearer not-a-jwt"),
        )
        .add_header(
            HeaderName::from_static("x-client-id"),
            header_value(&h.tenant_id.to_string()),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn client_header_must_match_the_token() {
    let h = TestHarness::new().await;

    let response = h
        .server
        .get("/v1/calls")
        .add_header(
            HeaderName::from_static("authorization"),
            header_value(&format!("Bearer {}", h.token("client_user"))),
        )
        .add_header(
            HeaderName::from_static("x-client-id"),
            header_value(&TenantId::generate().to_string()),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let response = h
        .server
        .get("/v1/calls")
        .add_header(
            HeaderName::from_static("authorization"),
            header_value(&format!("Bearer {}", h.token("client_user"))),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn agency_admin_may_act_for_any_tenant() {
    let h = TestHarness::new().await;
    let agency = TenantId::generate();

    let response = h
        .server
        .get("/v1/credits/balance")
        .add_header(
            HeaderName::from_static("authorization"),
            header_value(&format!("Bearer {}", token_for(agency, "agency_admin"))),
        )
        .add_header(
            HeaderName::from_static("x-client-id"),
            header_value(&h.tenant_id.to_string()),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["data"]["credits_balance"], 100);
}
