//! Idempotency-key behaviour on creation endpoints.

mod common;

use std::future::IntoFuture;
use std::time::Duration;

use axum::http::{HeaderName, StatusCode};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use common::{header_value, TestHarness};
use trudy_service::idempotency::{IDEMPOTENCY_KEY_HEADER, REPLAYED_HEADER};

fn key(value: &str) -> (HeaderName, axum::http::HeaderValue) {
    (HeaderName::from_static(IDEMPOTENCY_KEY_HEADER), header_value(value))
}

#[tokio::test]
async fn replayed_request_returns_identical_bytes_without_a_second_provider_call() {
    let h = TestHarness::new().await;
    let agent = h.seed_agent().await;
    Mock::given(method("POST"))
        .and(path("/calls"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "uv-call-once"})))
        .expect(1)
        .mount(&h.ultravox)
        .await;

    let body = json!({
        "agent_id": agent.id.to_string(),
        "phone_number": "+14155550100",
        "direction": "outbound",
    });

    let (name, value) = key("call-req-1");
    let first = h
        .user(h.server.post("/v1/calls"))
        .add_header(name.clone(), value.clone())
        .json(&body)
        .await;
    assert_eq!(first.status_code(), StatusCode::CREATED);
    assert!(first.headers().get(REPLAYED_HEADER).is_none());

    // Same request with its keys reordered.
    let reordered = format!(
        r#"{{"direction":"outbound","phone_number":"+14155550100","agent_id":"{}"}}"#,
        agent.id
    );
    let second = h
        .user(h.server.post("/v1/calls"))
        .add_header(name, value)
        .content_type("application/json")
        .bytes(reordered.into_bytes().into())
        .await;
    assert_eq!(second.status_code(), StatusCode::CREATED);
    assert_eq!(second.headers()[REPLAYED_HEADER], "true");
    assert_eq!(first.text(), second.text());

    let listed: Value = h.user(h.server.get("/v1/calls")).await.json();
    assert_eq!(listed["pagination"]["total"], 1);
    assert_eq!(h.events.events().len(), 1);
}

#[tokio::test]
async fn same_key_with_a_different_body_conflicts() {
    let h = TestHarness::new().await;
    let agent = h.seed_agent().await;
    h.mock_create("/calls", "uv-call-a").await;

    let (name, value) = key("call-req-2");
    let first = h
        .user(h.server.post("/v1/calls"))
        .add_header(name.clone(), value.clone())
        .json(&json!({
            "agent_id": agent.id.to_string(),
            "phone_number": "+14155550100",
            "direction": "outbound",
        }))
        .await;
    assert_eq!(first.status_code(), StatusCode::CREATED);

    let second = h
        .user(h.server.post("/v1/calls"))
        .add_header(name, value)
        .json(&json!({
            "agent_id": agent.id.to_string(),
            "phone_number": "+14155550199",
            "direction": "outbound",
        }))
        .await;
    assert_eq!(second.status_code(), StatusCode::CONFLICT);
    let body: Value = second.json();
    assert_eq!(body["error"]["code"], "idempotency_key_reused");
}

#[tokio::test]
async fn failed_requests_are_not_cached() {
    let h = TestHarness::with_credits(0).await;
    let agent = h.seed_agent().await;
    h.mock_create("/calls", "uv-call-b").await;

    let body = json!({
        "agent_id": agent.id.to_string(),
        "phone_number": "+14155550100",
        "direction": "outbound",
    });
    let (name, value) = key("call-req-3");

    let first = h
        .user(h.server.post("/v1/calls"))
        .add_header(name.clone(), value.clone())
        .json(&body)
        .await;
    assert_eq!(first.status_code(), StatusCode::PAYMENT_REQUIRED);

    let stripe = h
        .stripe_webhook(&json!({
            "id": "evt_topup",
            "type": "payment_intent.succeeded",
            "data": {"object": {
                "id": "pi_topup",
                "amount": 1000,
                "metadata": {"client_id": h.tenant_id.to_string()},
            }},
        }))
        .await;
    assert_eq!(stripe.status_code(), StatusCode::OK);

    let retry = h
        .user(h.server.post("/v1/calls"))
        .add_header(name, value)
        .json(&body)
        .await;
    assert_eq!(retry.status_code(), StatusCode::CREATED);
    assert!(retry.headers().get(REPLAYED_HEADER).is_none());
}

#[tokio::test]
async fn knowledge_base_creation_is_idempotent() {
    let h = TestHarness::new().await;
    h.mock_create("/corpora", "uv-corpus-1").await;

    let (name, value) = key("kb-1");
    let response = h
        .admin(h.server.post("/v1/knowledge-bases"))
        .add_header(name.clone(), value.clone())
        .json(&json!({"name": "FAQ"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let replay = h
        .admin(h.server.post("/v1/knowledge-bases"))
        .add_header(name, value)
        .json(&json!({"name": "FAQ"}))
        .await;
    assert_eq!(replay.headers()[REPLAYED_HEADER], "true");

    let listed: Value = h.user(h.server.get("/v1/knowledge-bases")).await.json();
    assert_eq!(listed["pagination"]["total"], 1);
}

#[tokio::test]
async fn racing_requests_with_one_key_both_get_the_first_stored_response() {
    let h = TestHarness::new().await;
    // Slow enough that both requests miss the lookup before either stores.
    Mock::given(method("POST"))
        .and(path("/corpora"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"id": "uv-corpus-race"}))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&h.ultravox)
        .await;

    let (name, value) = key("kb-race");
    let request = || {
        h.admin(h.server.post("/v1/knowledge-bases"))
            .add_header(name.clone(), value.clone())
            .json(&json!({"name": "FAQ"}))
            .into_future()
    };
    let (a, b) = tokio::join!(request(), request());

    assert_eq!(a.status_code(), StatusCode::CREATED);
    assert_eq!(b.status_code(), StatusCode::CREATED);
    let replayed: Vec<_> = [&a, &b]
        .into_iter()
        .filter(|r| r.headers().get(REPLAYED_HEADER).is_some())
        .collect();
    assert_eq!(replayed.len(), 1, "the losing writer replays the winner");
    assert_eq!(a.text(), b.text());

    // Later replays agree with both.
    let later = request().await;
    assert_eq!(later.headers()[REPLAYED_HEADER], "true");
    assert_eq!(later.text(), a.text());
}

#[tokio::test]
async fn expired_records_are_purged_by_the_operator_route() {
    let h = TestHarness::new().await;

    let response = h
        .internal(h.server.post("/internal/idempotency/cleanup"))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["deleted_count"], 0);
}
