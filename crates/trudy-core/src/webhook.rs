//! Egress webhook endpoints and deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeliveryId, TenantId, WebhookEndpointId};

/// Attempts allowed per delivery when an endpoint does not say otherwise.
pub const DEFAULT_DELIVERY_MAX_ATTEMPTS: u32 = 10;

/// Longest error text kept on a delivery record.
const MAX_ERROR_LEN: usize = 500;

/// A tenant-registered URL that receives signed event notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Endpoint ID.
    pub id: WebhookEndpointId,
    /// Owning tenant.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,
    /// HTTPS URL.
    pub url: String,
    /// Subscribed event types (`*` subscribes to everything).
    pub event_types: Vec<String>,
    /// HMAC secret shared with the subscriber.
    #[serde(skip_serializing)]
    pub secret: String,
    /// Disabled endpoints receive nothing.
    pub enabled: bool,
    /// Attempts per delivery before it is left `failed`.
    pub max_attempts: u32,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Updated.
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Whether this endpoint should receive `event_type`.
    #[must_use]
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.enabled
            && self
                .event_types
                .iter()
                .any(|subscribed| subscribed == event_type || subscribed == "*")
    }
}

str_enum! {
    /// Delivery state.
    pub enum DeliveryStatus("delivery status") {
        /// Created, not yet attempted (or waiting for a retry).
        Pending => "pending",
        /// Subscriber answered 2xx.
        Delivered => "delivered",
        /// Last attempt failed.
        Failed => "failed",
    }
}

/// The JSON body posted to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event type, e.g. `call.completed`.
    pub event: String,
    /// Event payload.
    pub data: serde_json::Value,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

/// One delivery of one event to one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Delivery ID.
    pub id: DeliveryId,
    /// Target endpoint.
    #[serde(rename = "webhook_endpoint_id")]
    pub endpoint_id: WebhookEndpointId,
    /// Tenant owning the endpoint.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,
    /// Event type.
    pub event_type: String,
    /// The envelope, exactly as it is signed and sent.
    pub payload: EventEnvelope,
    /// Current state.
    pub status: DeliveryStatus,
    /// Number of the current (or last) attempt, starting at 1.
    pub attempt: u32,
    /// HTTP status of the last attempt, if a response arrived.
    pub response_code: Option<u16>,
    /// Error of the last failed attempt.
    pub error_message: Option<String>,
    /// When the next retry is due.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the subscriber accepted the event.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Created.
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// A pending first attempt of `payload` to `endpoint`.
    #[must_use]
    pub fn pending(endpoint: &WebhookEndpoint, payload: EventEnvelope) -> Self {
        Self {
            id: DeliveryId::generate(),
            endpoint_id: endpoint.id,
            tenant_id: endpoint.tenant_id,
            event_type: payload.event.clone(),
            payload,
            status: DeliveryStatus::Pending,
            attempt: 1,
            response_code: None,
            error_message: None,
            next_attempt_at: None,
            delivered_at: None,
            created_at: Utc::now(),
        }
    }

    /// Record a 2xx answer.
    pub fn mark_delivered(&mut self, response_code: u16, at: DateTime<Utc>) {
        self.status = DeliveryStatus::Delivered;
        self.response_code = Some(response_code);
        self.error_message = None;
        self.next_attempt_at = None;
        self.delivered_at = Some(at);
    }

    /// Record a failed attempt.
    pub fn mark_failed(&mut self, response_code: Option<u16>, error: &str) {
        self.status = DeliveryStatus::Failed;
        self.response_code = response_code;
        self.error_message = Some(truncate(error, MAX_ERROR_LEN));
        self.next_attempt_at = None;
    }

    /// Whether another attempt is allowed under `max_attempts`.
    #[must_use]
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        self.status != DeliveryStatus::Delivered && self.attempt < max_attempts
    }

    /// Put the delivery back in the queue for its next attempt at `at`.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>) {
        self.attempt += 1;
        self.status = DeliveryStatus::Pending;
        self.next_attempt_at = Some(at);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(event_types: &[&str], enabled: bool) -> WebhookEndpoint {
        let now = Utc::now();
        WebhookEndpoint {
            id: WebhookEndpointId::generate(),
            tenant_id: TenantId::generate(),
            url: "https://hooks.example.com/trudy".into(),
            event_types: event_types.iter().map(ToString::to_string).collect(),
            secret: "s3cret".into(),
            enabled,
            max_attempts: DEFAULT_DELIVERY_MAX_ATTEMPTS,
            created_at: now,
            updated_at: now,
        }
    }

    fn envelope() -> EventEnvelope {
        EventEnvelope {
            event: "call.completed".into(),
            data: serde_json::json!({ "call_id": "abc" }),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn subscription_matching() {
        assert!(endpoint(&["call.completed"], true).subscribes_to("call.completed"));
        assert!(endpoint(&["*"], true).subscribes_to("voice.training.failed"));
        assert!(!endpoint(&["call.started"], true).subscribes_to("call.completed"));
        assert!(!endpoint(&["call.completed"], false).subscribes_to("call.completed"));
    }

    #[test]
    fn secret_is_never_serialized() {
        let json = serde_json::to_value(endpoint(&["*"], true)).unwrap();
        assert!(json.get("secret").is_none());
    }

    #[test]
    fn delivery_lifecycle() {
        let ep = endpoint(&["call.completed"], true);
        let mut delivery = WebhookDelivery::pending(&ep, envelope());
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt, 1);

        delivery.mark_failed(Some(503), "unavailable");
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert!(delivery.can_retry(3));

        delivery.schedule_retry(Utc::now());
        delivery.schedule_retry(Utc::now());
        assert_eq!(delivery.attempt, 3);
        assert!(!delivery.can_retry(3));

        delivery.mark_delivered(200, Utc::now());
        assert_eq!(delivery.status, DeliveryStatus::Delivered);
        assert!(delivery.error_message.is_none());
        assert!(!delivery.can_retry(10));
    }

    #[test]
    fn long_errors_are_truncated() {
        let ep = endpoint(&["*"], true);
        let mut delivery = WebhookDelivery::pending(&ep, envelope());
        delivery.mark_failed(None, &"é".repeat(400));
        let kept = delivery.error_message.unwrap();
        assert!(kept.len() <= MAX_ERROR_LEN);
        assert!(kept.chars().all(|c| c == 'é'));
    }
}
