//! Domain event bus.
//!
//! Handlers and the webhook reconciler publish a [`DomainEvent`] after every
//! state change they commit. The bus is an injected trait object so tests can
//! observe what was published.

use std::sync::Mutex;

use async_trait::async_trait;

use trudy_core::DomainEvent;

/// Sink for domain events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. Publishing never fails the caller.
    async fn publish(&self, event: &DomainEvent);
}

/// Bus that writes each event to the log.
#[derive(Debug, Default)]
pub struct TracingEventBus;

#[async_trait]
impl EventBus for TracingEventBus {
    async fn publish(&self, event: &DomainEvent) {
        tracing::info!(
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            data = %event.data,
            "Domain event"
        );
    }
}

/// Bus that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventBus {
    events: Mutex<Vec<DomainEvent>>,
}

impl MemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: &DomainEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trudy_core::{EventType, TenantId};

    #[tokio::test]
    async fn memory_bus_records_in_order() {
        let bus = MemoryEventBus::new();
        let tenant = TenantId::generate();
        bus.publish(&DomainEvent::new(EventType::CallCreated, tenant, json!({"n": 1})))
            .await;
        bus.publish(&DomainEvent::new(EventType::CallStarted, tenant, json!({"n": 2})))
            .await;

        let events = bus.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::CallCreated);
        assert_eq!(events[1].data["n"], 2);
    }
}
