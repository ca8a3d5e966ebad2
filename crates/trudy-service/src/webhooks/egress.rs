//! Outbound webhooks to tenant subscriber endpoints.
//!
//! Fan-out writes one pending [`WebhookDelivery`] per subscribed endpoint
//! before any HTTP request is made, so every attempt has a record to report
//! into. In [`EgressMode::Queued`] the delivery IDs go to a background worker
//! that retries failures with backoff up to the endpoint's `max_attempts`; in
//! [`EgressMode::Inline`] each delivery is attempted once by the caller.
//!
//! The queue lives in memory. A delivery still `pending` well after its due
//! time was lost with a previous process (or a dropped queue), and is picked
//! up again by the retry sweep, which the worker also runs once on startup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use trudy_core::{DeliveryId, DeliveryStatus, DomainEvent, WebhookDelivery, WebhookEndpoint};
use trudy_store::Store;

use crate::config::EgressMode;
use crate::crypto::sign_webhook;
use crate::retry::RetryPolicy;

/// Header carrying the Unix timestamp the signature covers.
pub const TIMESTAMP_HEADER: &str = "x-trudy-timestamp";
/// Header carrying the hex HMAC of `"{timestamp}.{body}"`.
pub const SIGNATURE_HEADER: &str = "x-trudy-signature";
/// Header carrying the event type.
pub const EVENT_HEADER: &str = "x-trudy-event";
/// Header carrying the delivery ID.
pub const DELIVERY_HEADER: &str = "x-trudy-delivery";

/// Largest number of deliveries one retry sweep looks at.
const RETRY_SWEEP_LIMIT: usize = 500;

/// How long a pending delivery may sit past its due time before a sweep
/// treats it as stranded.
const STRANDED_AFTER_SECONDS: i64 = 300;

/// Hands domain events to subscriber endpoints.
pub struct EgressDispatcher {
    deliverer: Arc<Deliverer>,
    queue: Option<mpsc::UnboundedSender<DeliveryId>>,
}

struct Deliverer {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl EgressDispatcher {
    /// Create a dispatcher. In queued mode this spawns the delivery worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// In queued mode, panics if called outside a Tokio runtime.
    pub fn new(
        store: Arc<dyn Store>,
        mode: EgressMode,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let deliverer = Arc::new(Deliverer {
            store,
            client,
            retry,
        });

        let queue = match mode {
            EgressMode::Inline => None,
            EgressMode::Queued => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_worker(deliverer.clone(), tx.clone(), rx));
                Some(tx)
            }
        };

        Ok(Self { deliverer, queue })
    }

    /// Create a delivery for every endpoint of the event's tenant subscribed
    /// to its type, then dispatch them. Returns the created delivery IDs.
    ///
    /// Failures are logged and recorded on the deliveries; they never reach
    /// the caller.
    pub async fn fan_out(&self, event: &DomainEvent) -> Vec<DeliveryId> {
        let event_type = event.event_type.as_str();
        let endpoints = match self
            .deliverer
            .store
            .list_subscribed_endpoints(event.tenant_id, event_type)
            .await
        {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::error!(error = %e, event_type, "Failed to list webhook endpoints");
                return Vec::new();
            }
        };

        let envelope = event.envelope();
        let mut created = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let mut delivery = WebhookDelivery::pending(&endpoint, envelope.clone());
            if let Err(e) = self.deliverer.store.insert_delivery(&delivery).await {
                tracing::error!(
                    error = %e,
                    endpoint_id = %endpoint.id,
                    event_type,
                    "Failed to record webhook delivery"
                );
                continue;
            }
            created.push(delivery.id);

            match &self.queue {
                Some(queue) => enqueue(queue, delivery.id),
                None => {
                    self.deliverer.attempt(&endpoint, &mut delivery).await;
                    self.deliverer.save(&delivery).await;
                }
            }
        }

        if !created.is_empty() {
            tracing::debug!(event_type, deliveries = created.len(), "Webhook fan-out");
        }
        created
    }

    /// Re-dispatch failed deliveries that still have attempts left, and
    /// pending ones left stranded by a lost queue. Returns how many were
    /// re-dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error if the deliveries cannot be listed or updated.
    pub async fn retry_failed(&self) -> trudy_store::Result<usize> {
        let requeued = self.deliverer.sweep(self.queue.as_ref()).await?;
        tracing::info!(requeued, "Webhook deliveries re-dispatched");
        Ok(requeued)
    }
}

fn enqueue(queue: &mpsc::UnboundedSender<DeliveryId>, id: DeliveryId) {
    if queue.send(id).is_err() {
        tracing::error!(delivery_id = %id, "Egress worker is gone; delivery left pending");
    }
}

/// Consume delivery IDs until every sender is dropped.
async fn run_worker(
    deliverer: Arc<Deliverer>,
    requeue: mpsc::UnboundedSender<DeliveryId>,
    mut rx: mpsc::UnboundedReceiver<DeliveryId>,
) {
    tracing::info!("Egress worker started");
    match deliverer.sweep(Some(&requeue)).await {
        Ok(0) => {}
        Ok(requeued) => {
            tracing::info!(requeued, "Re-queued webhook deliveries left from before startup");
        }
        Err(e) => tracing::error!(error = %e, "Startup webhook delivery sweep failed"),
    }
    while let Some(id) = rx.recv().await {
        let deliverer = deliverer.clone();
        let requeue = requeue.clone();
        tokio::spawn(async move {
            if let Some(delay) = deliverer.process(id).await {
                tokio::time::sleep(delay).await;
                enqueue(&requeue, id);
            }
        });
    }
}

impl Deliverer {
    /// Mark retryable deliveries due now and dispatch them, through `queue`
    /// when given or inline otherwise.
    async fn sweep(
        &self,
        queue: Option<&mpsc::UnboundedSender<DeliveryId>>,
    ) -> trudy_store::Result<usize> {
        let now = Utc::now();
        let stranded_before = now - chrono::Duration::seconds(STRANDED_AFTER_SECONDS);
        let candidates = self
            .store
            .list_retryable_deliveries(stranded_before, RETRY_SWEEP_LIMIT)
            .await?;
        let mut requeued = 0;

        for mut delivery in candidates {
            let Some(endpoint) = self.store.find_endpoint(delivery.endpoint_id).await? else {
                continue;
            };
            if !endpoint.enabled {
                continue;
            }
            match delivery.status {
                DeliveryStatus::Failed if delivery.can_retry(endpoint.max_attempts) => {
                    delivery.schedule_retry(now);
                }
                // Its attempt number was never used; claim it for this sweep.
                DeliveryStatus::Pending => delivery.next_attempt_at = Some(now),
                _ => continue,
            }
            self.store.update_delivery(&delivery).await?;
            requeued += 1;

            match queue {
                Some(queue) => enqueue(queue, delivery.id),
                None => {
                    self.attempt(&endpoint, &mut delivery).await;
                    self.save(&delivery).await;
                }
            }
        }
        Ok(requeued)
    }

    /// Attempt a queued delivery. Returns the delay before the next attempt
    /// when one is scheduled.
    async fn process(&self, id: DeliveryId) -> Option<Duration> {
        let mut delivery = match self.store.get_delivery(id).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!(error = %e, delivery_id = %id, "Failed to load webhook delivery");
                return None;
            }
        };
        if delivery.status == DeliveryStatus::Delivered {
            return None;
        }

        let endpoint = match self.store.find_endpoint(delivery.endpoint_id).await {
            Ok(Some(endpoint)) if endpoint.enabled => endpoint,
            Ok(_) => {
                delivery.mark_failed(None, "endpoint removed or disabled");
                self.save(&delivery).await;
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, delivery_id = %id, "Failed to load webhook endpoint");
                return None;
            }
        };

        self.attempt(&endpoint, &mut delivery).await;
        // The outcome and the next retry go out in one write, so a sweep never
        // sees this delivery `failed` while a retry is already scheduled.
        let retry = if delivery.status == DeliveryStatus::Failed
            && delivery.can_retry(endpoint.max_attempts)
        {
            let delay = self.retry.delay_for(delivery.attempt);
            let next = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            delivery.schedule_retry(next);
            Some(delay)
        } else {
            None
        };
        self.save(&delivery).await;
        retry
    }

    /// Make one signed POST and record the outcome on `delivery`. The caller
    /// saves it.
    async fn attempt(&self, endpoint: &WebhookEndpoint, delivery: &mut WebhookDelivery) {
        let body = match serde_json::to_string(&delivery.payload) {
            Ok(body) => body,
            Err(e) => {
                delivery.mark_failed(None, &format!("payload serialization failed: {e}"));
                return;
            }
        };
        let timestamp = Utc::now().timestamp();
        let signature = sign_webhook(&endpoint.secret, timestamp, &body);

        let result = self
            .client
            .post(&endpoint.url)
            .header("content-type", "application/json")
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, &delivery.event_type)
            .header(DELIVERY_HEADER, delivery.id.to_string())
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                delivery.mark_delivered(response.status().as_u16(), Utc::now());
                tracing::debug!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    attempt = delivery.attempt,
                    "Webhook delivered"
                );
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                delivery.mark_failed(Some(status.as_u16()), &format!("HTTP {status}: {text}"));
                tracing::warn!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    attempt = delivery.attempt,
                    status = status.as_u16(),
                    "Webhook delivery rejected"
                );
            }
            Err(e) => {
                delivery.mark_failed(None, &e.to_string());
                tracing::warn!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    attempt = delivery.attempt,
                    error = %e,
                    "Webhook delivery failed"
                );
            }
        }
    }

    async fn save(&self, delivery: &WebhookDelivery) {
        if let Err(e) = self.store.update_delivery(delivery).await {
            tracing::error!(error = %e, delivery_id = %delivery.id, "Failed to record delivery outcome");
        }
    }
}
