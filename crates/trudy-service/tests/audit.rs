//! Audit trail written by the mutating handlers.

mod common;

use axum::http::StatusCode;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use common::TestHarness;

#[tokio::test]
async fn tool_changes_are_audited_newest_first() {
    let h = TestHarness::new().await;
    h.mock_create("/tools", "uv-tool-1").await;
    Mock::given(method("PATCH"))
        .and(path("/tools/uv-tool-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&h.ultravox)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/tools/uv-tool-1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&h.ultravox)
        .await;

    let created: Value = h
        .admin(h.server.post("/v1/tools"))
        .json(&json!({
            "name": "lookup",
            "endpoint": "https://clinic.example/lookup",
            "method": "POST",
        }))
        .await
        .json();
    let tool_id = created["data"]["id"].as_str().unwrap().to_string();

    let updated = h
        .admin(h.server.patch(&format!("/v1/tools/{tool_id}")))
        .json(&json!({"description": "Find a patient record"}))
        .await;
    assert_eq!(updated.status_code(), StatusCode::OK);
    let deleted = h
        .admin(h.server.delete(&format!("/v1/tools/{tool_id}")))
        .await;
    assert_eq!(deleted.status_code(), StatusCode::OK);

    let response = h.admin(h.server.get("/v1/audit-logs")).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    let entries = body["data"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(body["pagination"]["total"], 3);

    let actions: Vec<&str> = entries
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, ["delete", "update", "insert"]);
    for entry in entries {
        assert_eq!(entry["table_name"], "tools");
        assert_eq!(entry["record_id"], tool_id);
        assert_eq!(entry["user_id"], "user-1");
        assert_eq!(entry["client_id"], h.tenant_id.to_string());
    }

    assert_eq!(
        entries[1]["diff"]["description"],
        json!({"before": null, "after": "Find a patient record"})
    );
    assert!(entries[1]["diff"].get("updated_at").is_none());
    assert_eq!(entries[0]["metadata"]["name"], "lookup");
}

#[tokio::test]
async fn audit_log_is_tenant_scoped_and_admin_only() {
    let h = TestHarness::new().await;
    h.admin(h.server.post("/v1/api-keys"))
        .json(&json!({"service": "openai", "key_name": "Main", "api_key": "sk-1"}))
        .await;

    let forbidden = h.user(h.server.get("/v1/audit-logs")).await;
    assert_eq!(forbidden.status_code(), StatusCode::FORBIDDEN);

    let other = TestHarness::new().await;
    let body: Value = other.admin(other.server.get("/v1/audit-logs")).await.json();
    assert_eq!(body["data"], json!([]));

    let body: Value = h.admin(h.server.get("/v1/audit-logs")).await.json();
    assert_eq!(body["data"][0]["table_name"], "api_keys");
    assert_eq!(body["data"][0]["metadata"]["service"], "openai");
    assert!(!body.to_string().contains("sk-1"));
}
