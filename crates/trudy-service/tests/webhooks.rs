//! Ultravox and Stripe webhook ingress.

mod common;

use axum::http::{HeaderName, StatusCode};
use chrono::Utc;
use serde_json::{json, Value};

use common::{header_value, TestHarness, ULTRAVOX_SECRET};
use trudy_core::{
    balance_of, Call, CallDirection, CallStatus, EventType, SubscriptionStatus, Tenant, TenantId,
    VoiceStatus,
};
use trudy_service::crypto::sign_webhook;
use trudy_store::{Page, Store};

async fn seed_call(h: &TestHarness, ultravox_call_id: &str) -> Call {
    let agent = h.seed_agent().await;
    let mut call = Call::new(
        h.tenant_id,
        agent.id,
        "+14155550100",
        CallDirection::Outbound,
    );
    call.ultravox_call_id = Some(ultravox_call_id.into());
    h.store.insert_call(&call).await.unwrap();
    call
}

fn completed(ultravox_call_id: &str, duration_seconds: f64) -> Value {
    json!({
        "event": "call.completed",
        "call_id": ultravox_call_id,
        "timestamp": "2024-05-01T12:05:00Z",
        "data": {
            "duration_seconds": duration_seconds,
            "cost_usd": 0.42,
            "recording_url": "https://recordings.example/1.wav",
        },
    })
}

// ============================================================================
// Signatures
// ============================================================================

#[tokio::test]
async fn unsigned_or_tampered_deliveries_are_rejected_before_any_change() {
    let h = TestHarness::new().await;
    let call = seed_call(&h, "uv-sig").await;
    let body = completed("uv-sig", 600.0).to_string();
    let timestamp = Utc::now().timestamp();

    let unsigned = h
        .server
        .post("/webhooks/ultravox")
        .bytes(body.clone().into())
        .await;
    assert_eq!(unsigned.status_code(), StatusCode::UNAUTHORIZED);

    let signature = sign_webhook("wrong-secret", timestamp, &body);
    let forged = h
        .server
        .post("/webhooks/ultravox")
        .add_header(
            HeaderName::from_static("x-ultravox-signature"),
            header_value(&signature),
        )
        .add_header(
            HeaderName::from_static("x-ultravox-timestamp"),
            header_value(&timestamp.to_string()),
        )
        .bytes(body.clone().into())
        .await;
    assert_eq!(forged.status_code(), StatusCode::UNAUTHORIZED);

    let stale_ts = timestamp - 3600;
    let stale = h
        .server
        .post("/webhooks/ultravox")
        .add_header(
            HeaderName::from_static("x-ultravox-signature"),
            header_value(&sign_webhook(ULTRAVOX_SECRET, stale_ts, &body)),
        )
        .add_header(
            HeaderName::from_static("x-ultravox-timestamp"),
            header_value(&stale_ts.to_string()),
        )
        .bytes(body.into())
        .await;
    assert_eq!(stale.status_code(), StatusCode::UNAUTHORIZED);

    assert_eq!(h.balance().await, 100);
    let stored = h.store.get_call(h.tenant_id, call.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Queued);
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn signed_but_malformed_payload_is_a_bad_request() {
    let h = TestHarness::new().await;
    let body = "{not json";
    let timestamp = Utc::now().timestamp();

    let response = h
        .server
        .post("/webhooks/ultravox")
        .add_header(
            HeaderName::from_static("x-ultravox-signature"),
            header_value(&sign_webhook(ULTRAVOX_SECRET, timestamp, body)),
        )
        .add_header(
            HeaderName::from_static("x-ultravox-timestamp"),
            header_value(&timestamp.to_string()),
        )
        .bytes(body.into())
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// Call lifecycle
// ============================================================================

#[tokio::test]
async fn completed_call_is_billed_once_across_redeliveries() {
    let h = TestHarness::new().await;
    let call = seed_call(&h, "uv-bill").await;

    let first = h.ultravox_webhook(&completed("uv-bill", 125.0)).await;
    assert_eq!(first.status_code(), StatusCode::OK);
    assert_eq!(first.json::<Value>()["outcome"], "applied");

    for _ in 0..4 {
        let again = h.ultravox_webhook(&completed("uv-bill", 125.0)).await;
        assert_eq!(again.status_code(), StatusCode::OK);
        assert_eq!(again.json::<Value>()["outcome"], "duplicate");
    }

    // 125 seconds is three started minutes.
    assert_eq!(h.balance().await, 97);

    let stored = h.store.get_call(h.tenant_id, call.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Completed);
    assert_eq!(stored.duration_seconds, Some(125));
    assert_eq!(stored.recording_url.as_deref(), Some("https://recordings.example/1.wav"));

    let ledger = h
        .store
        .list_ledger_entries(h.tenant_id, Page::default())
        .await
        .unwrap();
    let spends: Vec<_> = ledger
        .items
        .iter()
        .filter(|e| e.reference_id == call.id.to_string())
        .collect();
    assert_eq!(spends.len(), 1);
    assert_eq!(spends[0].amount, 3);

    let completed_events = h
        .events
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::CallCompleted)
        .count();
    assert_eq!(completed_events, 1);
}

#[tokio::test]
async fn zero_length_call_costs_one_credit() {
    let h = TestHarness::new().await;
    seed_call(&h, "uv-zero").await;

    h.ultravox_webhook(&completed("uv-zero", 0.0)).await;
    assert_eq!(h.balance().await, 99);
}

#[tokio::test]
async fn absurd_call_duration_is_rejected_without_billing() {
    let h = TestHarness::new().await;
    let call = seed_call(&h, "uv-huge").await;

    let response = h.ultravox_webhook(&completed("uv-huge", 1e19)).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"]["code"], "bad_request");

    assert_eq!(h.balance().await, 100);
    let stored = h.store.get_call(h.tenant_id, call.id).await.unwrap().unwrap();
    assert_ne!(stored.status, CallStatus::Completed);
    assert_eq!(stored.duration_seconds, None);

    // A full day is still a plausible call.
    let day = h.ultravox_webhook(&completed("uv-huge", 86_400.0)).await;
    assert_eq!(day.status_code(), StatusCode::OK);
    let stored = h.store.get_call(h.tenant_id, call.id).await.unwrap().unwrap();
    assert_eq!(stored.duration_seconds, Some(86_400));
}

#[tokio::test]
async fn concurrent_redeliveries_debit_once() {
    let h = TestHarness::new().await;
    let call = seed_call(&h, "uv-race").await;
    let body = completed("uv-race", 125.0);

    let (a, b) = tokio::join!(h.ultravox_webhook(&body), h.ultravox_webhook(&body));
    assert_eq!(a.status_code(), StatusCode::OK);
    assert_eq!(b.status_code(), StatusCode::OK);
    let mut outcomes = vec![
        a.json::<Value>()["outcome"].as_str().unwrap().to_string(),
        b.json::<Value>()["outcome"].as_str().unwrap().to_string(),
    ];
    outcomes.sort();
    assert_eq!(outcomes, ["applied", "duplicate"]);

    assert_eq!(h.balance().await, 97);
    let ledger = h
        .store
        .list_ledger_entries(h.tenant_id, Page::default())
        .await
        .unwrap();
    let spends = ledger
        .items
        .iter()
        .filter(|e| e.reference_id == call.id.to_string())
        .count();
    assert_eq!(spends, 1);
}

#[tokio::test]
async fn call_moves_through_started_to_completed() {
    let h = TestHarness::new().await;
    let call = seed_call(&h, "uv-life").await;

    let started = h
        .ultravox_webhook(&json!({
            "event": "call.started",
            "call_id": "uv-life",
            "timestamp": "2024-05-01T12:00:00Z",
        }))
        .await;
    assert_eq!(started.json::<Value>()["outcome"], "applied");
    let stored = h.store.get_call(h.tenant_id, call.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::InProgress);
    assert_eq!(
        stored.started_at.map(|t| t.to_rfc3339()),
        Some("2024-05-01T12:00:00+00:00".to_string())
    );

    let again = h
        .ultravox_webhook(&json!({"event": "call.started", "call_id": "uv-life"}))
        .await;
    assert_eq!(again.json::<Value>()["outcome"], "duplicate");

    h.ultravox_webhook(&completed("uv-life", 61.0)).await;
    let stored = h.store.get_call(h.tenant_id, call.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Completed);
    assert_eq!(h.balance().await, 98);
}

#[tokio::test]
async fn failure_after_completion_does_not_reopen_the_call() {
    let h = TestHarness::new().await;
    let call = seed_call(&h, "uv-late").await;

    h.ultravox_webhook(&completed("uv-late", 30.0)).await;
    let late = h
        .ultravox_webhook(&json!({
            "event": "call.failed",
            "call_id": "uv-late",
            "data": {"error_message": "carrier hung up"},
        }))
        .await;
    assert_eq!(late.json::<Value>()["outcome"], "duplicate");

    let stored = h.store.get_call(h.tenant_id, call.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Completed);
    assert!(stored.error_message.is_none());
}

#[tokio::test]
async fn failed_call_records_the_error_and_is_not_billed() {
    let h = TestHarness::new().await;
    let call = seed_call(&h, "uv-fail").await;

    let response = h
        .ultravox_webhook(&json!({
            "event": "call.failed",
            "call_id": "uv-fail",
            "data": {"error_message": "number unreachable"},
        }))
        .await;
    assert_eq!(response.json::<Value>()["outcome"], "applied");

    let stored = h.store.get_call(h.tenant_id, call.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("number unreachable"));
    assert!(stored.ended_at.is_some());
    assert_eq!(h.balance().await, 100);
}

#[tokio::test]
async fn unknown_calls_and_events_are_acknowledged() {
    let h = TestHarness::new().await;

    let unknown_call = h.ultravox_webhook(&completed("uv-nobody", 60.0)).await;
    assert_eq!(unknown_call.status_code(), StatusCode::OK);
    assert_eq!(unknown_call.json::<Value>()["outcome"], "no_match");

    let unknown_event = h
        .ultravox_webhook(&json!({"event": "call.transcribed", "call_id": "uv-nobody"}))
        .await;
    assert_eq!(unknown_event.status_code(), StatusCode::OK);
    assert_eq!(unknown_event.json::<Value>()["outcome"], "ignored");
}

// ============================================================================
// Voice training
// ============================================================================

#[tokio::test]
async fn voice_training_completion_activates_the_voice_once() {
    let h = TestHarness::new().await;
    let mut voice = h.seed_voice().await;
    voice.status = VoiceStatus::Training;
    voice.ultravox_voice_id = Some("uv-voice-train".into());
    h.store.update_voice(&voice).await.unwrap();

    let body = json!({"event": "voice.training.completed", "voice_id": "uv-voice-train"});
    let first = h.ultravox_webhook(&body).await;
    assert_eq!(first.json::<Value>()["outcome"], "applied");
    let second = h.ultravox_webhook(&body).await;
    assert_eq!(second.json::<Value>()["outcome"], "duplicate");

    let stored = h.store.find_voice(voice.id).await.unwrap().unwrap();
    assert_eq!(stored.status, VoiceStatus::Active);
    assert_eq!(stored.training_info["progress"], 100);

    let trained = h
        .events
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::VoiceTrainingCompleted)
        .count();
    assert_eq!(trained, 1);
}

#[tokio::test]
async fn voice_training_failure_keeps_the_reason() {
    let h = TestHarness::new().await;
    let mut voice = h.seed_voice().await;
    voice.status = VoiceStatus::Training;
    voice.ultravox_voice_id = Some("uv-voice-bad".into());
    h.store.update_voice(&voice).await.unwrap();

    h.ultravox_webhook(&json!({
        "event": "voice.training.failed",
        "voice_id": "uv-voice-bad",
        "error_message": "samples too noisy",
    }))
    .await;

    let stored = h.store.find_voice(voice.id).await.unwrap().unwrap();
    assert_eq!(stored.status, VoiceStatus::Failed);
    assert_eq!(stored.training_info["error_message"], "samples too noisy");
}

// ============================================================================
// Stripe
// ============================================================================

fn payment(intent_id: &str, amount_cents: i64, tenant_id: TenantId) -> Value {
    json!({
        "id": format!("evt_{intent_id}"),
        "type": "payment_intent.succeeded",
        "data": {"object": {
            "id": intent_id,
            "amount": amount_cents,
            "metadata": {"client_id": tenant_id.to_string()},
        }},
    })
}

#[tokio::test]
async fn payment_credits_the_tenant_exactly_once() {
    let h = TestHarness::new().await;

    let first = h.stripe_webhook(&payment("pi_1", 2500, h.tenant_id)).await;
    assert_eq!(first.status_code(), StatusCode::OK);
    assert_eq!(first.json::<Value>()["outcome"], "applied");

    let again = h.stripe_webhook(&payment("pi_1", 2500, h.tenant_id)).await;
    assert_eq!(again.json::<Value>()["outcome"], "duplicate");

    assert_eq!(h.balance().await, 125);

    let purchases: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::CreditsPurchased)
        .collect();
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].data["credits"], 25);
    assert_eq!(purchases[0].data["transaction_id"], "pi_1");
}

#[tokio::test]
async fn payment_for_an_unknown_tenant_is_not_credited() {
    let h = TestHarness::new().await;

    let response = h
        .stripe_webhook(&payment("pi_2", 1000, TenantId::generate()))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["outcome"], "no_match");
    assert_eq!(h.balance().await, 100);
}

#[tokio::test]
async fn bad_stripe_signature_is_rejected() {
    let h = TestHarness::new().await;
    let body = payment("pi_3", 1000, h.tenant_id).to_string();

    let response = h
        .server
        .post("/webhooks/stripe")
        .add_header(
            HeaderName::from_static("stripe-signature"),
            header_value(&format!("t={},v1=deadbeef", Utc::now().timestamp())),
        )
        .bytes(body.into())
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(h.balance().await, 100);
}

#[tokio::test]
async fn subscription_changes_update_the_tenant() {
    let h = TestHarness::new().await;
    let mut tenant = Tenant::new(TenantId::generate(), "Paying Clinic");
    tenant.stripe_customer_id = Some("cus_123".into());
    h.store.insert_tenant(&tenant).await.unwrap();

    let event = |status: &str| {
        json!({
            "id": "evt_sub",
            "type": "customer.subscription.updated",
            "data": {"object": {"customer": "cus_123", "status": status}},
        })
    };

    let past_due = h.stripe_webhook(&event("past_due")).await;
    assert_eq!(past_due.json::<Value>()["outcome"], "applied");
    let stored = h.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(stored.subscription_status, SubscriptionStatus::Suspended);

    let repeat = h.stripe_webhook(&event("unpaid")).await;
    assert_eq!(repeat.json::<Value>()["outcome"], "duplicate");

    h.stripe_webhook(&event("canceled")).await;
    let stored = h.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(stored.subscription_status, SubscriptionStatus::Cancelled);

    // Unmapped statuses fall back to active.
    h.stripe_webhook(&event("something_new")).await;
    let stored = h.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn unhandled_stripe_events_are_ignored() {
    let h = TestHarness::new().await;

    let response = h
        .stripe_webhook(&json!({
            "id": "evt_x",
            "type": "invoice.created",
            "data": {"object": {}},
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["outcome"], "ignored");
}

// ============================================================================
// Ledger
// ============================================================================

#[tokio::test]
async fn interleaved_payments_and_completions_balance_out() {
    let h = TestHarness::new().await;
    seed_call(&h, "uv-mix-1").await;
    seed_call(&h, "uv-mix-2").await;
    seed_call(&h, "uv-mix-3").await;

    let call_1 = completed("uv-mix-1", 125.0);
    let call_2 = completed("uv-mix-2", 61.0);
    let call_3 = completed("uv-mix-3", 0.0);
    let pay_a = payment("pi_mix_a", 1500, h.tenant_id);
    let pay_b = payment("pi_mix_b", 2599, h.tenant_id);

    // Every event arrives at least twice, out of order.
    let sequence = [
        (true, &call_1),
        (false, &pay_a),
        (true, &call_2),
        (true, &call_1),
        (false, &pay_a),
        (false, &pay_b),
        (true, &call_3),
        (true, &call_2),
        (false, &pay_b),
        (true, &call_3),
        (true, &call_1),
        (false, &pay_a),
    ];
    for (from_ultravox, body) in sequence {
        let response = if from_ultravox {
            h.ultravox_webhook(body).await
        } else {
            h.stripe_webhook(body).await
        };
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    // 100 seeded + 15 + 25 purchased - (3 + 2 + 1) for the three calls.
    assert_eq!(h.balance().await, 100 + 15 + 25 - (3 + 2 + 1));

    let ledger = h
        .store
        .list_ledger_entries(h.tenant_id, Page::default())
        .await
        .unwrap();
    assert_eq!(ledger.total, 6);
    assert_eq!(balance_of(&ledger.items), h.balance().await);
}
