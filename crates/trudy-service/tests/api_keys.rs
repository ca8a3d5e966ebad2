//! Tenant API keys and TTS provider configuration.

mod common;

use axum::http::StatusCode;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

use common::TestHarness;
use trudy_service::secrets::{KeyCipher, MASTER_KEY_LEN};
use trudy_store::Store;

fn master_key() -> String {
    BASE64.encode([3u8; MASTER_KEY_LEN])
}

#[tokio::test]
async fn keys_are_sealed_and_never_returned() {
    let h = TestHarness::with_config(|c| c.api_key_encryption_key = Some(master_key())).await;

    let response = h
        .admin(h.server.post("/v1/api-keys"))
        .json(&json!({
            "service": "elevenlabs",
            "key_name": "Production",
            "api_key": "xi-live-0001",
            "settings": {"model": "turbo"},
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let text = response.text();
    assert!(!text.contains("xi-live-0001"));
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["data"]["client_id"], h.tenant_id.to_string());
    assert_eq!(body["data"]["encrypted"], true);
    assert_eq!(body["data"]["is_active"], true);

    let stored = h
        .store
        .get_api_key_for_service(h.tenant_id, "elevenlabs")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(stored.encrypted_key, "xi-live-0001");
    let cipher = KeyCipher::new(&master_key(), false).unwrap();
    assert_eq!(
        cipher.open(&stored.encrypted_key, stored.encrypted).unwrap(),
        "xi-live-0001"
    );

    let listed = h.admin(h.server.get("/v1/api-keys")).await;
    assert_eq!(listed.status_code(), StatusCode::OK);
    assert!(!listed.text().contains("encrypted_key"));
    assert_eq!(listed.json::<Value>()["pagination"]["total"], 1);
}

#[tokio::test]
async fn duplicate_key_name_conflicts() {
    let h = TestHarness::new().await;
    let body = json!({"service": "openai", "key_name": "Main", "api_key": "sk-1"});

    let first = h.admin(h.server.post("/v1/api-keys")).json(&body).await;
    assert_eq!(first.status_code(), StatusCode::CREATED);

    let second = h.admin(h.server.post("/v1/api-keys")).json(&body).await;
    assert_eq!(second.status_code(), StatusCode::CONFLICT);
    assert_eq!(second.json::<Value>()["error"]["code"], "conflict");
}

#[tokio::test]
async fn without_a_master_key_fail_open_stores_plaintext() {
    let h = TestHarness::new().await;

    let response = h
        .admin(h.server.post("/v1/api-keys"))
        .json(&json!({"service": "azure", "key_name": "Speech", "api_key": "az-123"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    assert_eq!(response.json::<Value>()["data"]["encrypted"], false);

    let stored = h
        .store
        .get_api_key_for_service(h.tenant_id, "azure")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.encrypted_key, "az-123");
    assert!(!stored.encrypted);
}

#[tokio::test]
async fn without_a_master_key_fail_closed_refuses_to_store() {
    let h = TestHarness::with_config(|c| c.api_key_encryption_fail_open = false).await;

    let response = h
        .admin(h.server.post("/v1/api-keys"))
        .json(&json!({"service": "azure", "key_name": "Speech", "api_key": "az-123"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        response.json::<Value>()["error"]["message"],
        "Failed to encrypt API key"
    );
    assert!(h.store.list_api_keys(h.tenant_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn only_admins_manage_keys() {
    let h = TestHarness::new().await;

    let response = h
        .user(h.server.post("/v1/api-keys"))
        .json(&json!({"service": "openai", "key_name": "Main", "api_key": "sk-1"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let response = h.user(h.server.get("/v1/api-keys")).await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tts_provider_key_is_replaced_in_place() {
    let h = TestHarness::with_config(|c| c.api_key_encryption_key = Some(master_key())).await;

    let first: Value = h
        .admin(h.server.patch("/v1/providers/tts"))
        .json(&json!({"provider": "elevenlabs", "api_key": "xi-old", "voice_id": "rachel"}))
        .await
        .json();
    assert_eq!(first["data"]["key_name"], "Elevenlabs TTS Key");
    assert_eq!(first["data"]["settings"]["voice_id"], "rachel");
    let key_id = first["data"]["id"].clone();

    let second = h
        .admin(h.server.patch("/v1/providers/tts"))
        .json(&json!({"provider": "elevenlabs", "api_key": "xi-new", "settings": {"stability": 0.4}}))
        .await;
    assert_eq!(second.status_code(), StatusCode::OK);
    let second: Value = second.json();
    assert_eq!(second["data"]["id"], key_id);
    assert_eq!(second["data"]["settings"], json!({"stability": 0.4}));

    let keys = h.store.list_api_keys(h.tenant_id).await.unwrap();
    assert_eq!(keys.len(), 1);
    let cipher = KeyCipher::new(&master_key(), false).unwrap();
    assert_eq!(
        cipher.open(&keys[0].encrypted_key, keys[0].encrypted).unwrap(),
        "xi-new"
    );

    let unknown = h
        .admin(h.server.patch("/v1/providers/tts"))
        .json(&json!({"provider": "polly", "api_key": "x"}))
        .await;
    assert_eq!(unknown.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
}
