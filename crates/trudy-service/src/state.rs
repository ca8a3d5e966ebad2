//! Application state.

use std::sync::Arc;
use std::time::Duration;

use trudy_core::DomainEvent;
use trudy_store::Store;

use crate::auth::JwksCache;
use crate::config::ServiceConfig;
use crate::events::{EventBus, TracingEventBus};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::secrets::KeyCipher;
use crate::ultravox::{UltravoxClient, UltravoxError};
use crate::webhooks::egress::EgressDispatcher;

/// Failure while wiring the application together.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// An HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The Ultravox client could not be built.
    #[error("Ultravox client error: {0}")]
    Ultravox(#[from] UltravoxError),
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Ultravox API client.
    pub ultravox: Arc<UltravoxClient>,

    /// Domain event sink.
    pub events: Arc<dyn EventBus>,

    /// Egress webhook fan-out.
    pub egress: Arc<EgressDispatcher>,

    /// Signing keys for bearer tokens.
    pub jwks: Arc<JwksCache>,

    /// Per-client request counters for `/v1`.
    pub rate_limiter: Arc<RateLimiter>,

    /// Seals tenant API keys.
    pub key_cipher: Arc<KeyCipher>,
}

impl AppState {
    /// Create application state that logs domain events.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// With queued egress, panics if called outside a Tokio runtime.
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Result<Self, StartupError> {
        Self::with_event_bus(store, config, Arc::new(TracingEventBus))
    }

    /// Create application state publishing to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// With queued egress, panics if called outside a Tokio runtime.
    pub fn with_event_bus(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        events: Arc<dyn EventBus>,
    ) -> Result<Self, StartupError> {
        let provider_retry = RetryPolicy::with_max_attempts(config.provider_max_attempts);
        let ultravox = UltravoxClient::new(
            &config.ultravox_base_url,
            &config.ultravox_api_key,
            Duration::from_secs(config.provider_timeout_seconds),
            provider_retry,
        )?;
        if config.ultravox_api_key.is_empty() {
            tracing::warn!("ULTRAVOX_API_KEY not configured - provider calls will be rejected");
        }

        let egress = EgressDispatcher::new(
            store.clone(),
            config.egress_mode,
            Duration::from_secs(config.egress_timeout_seconds),
            RetryPolicy::default(),
        )?;
        tracing::info!(mode = ?config.egress_mode, "Egress webhooks enabled");

        let jwks = JwksCache::new(&config.auth_issuer, config.jwks_serve_stale)?;
        if config.auth_hs256_secret.is_some() {
            tracing::info!("Bearer tokens validated with the shared HS256 secret");
        }

        let rate_limiter = RateLimiter::per_minute(config.rate_limit_per_minute);
        if config.rate_limit_enabled {
            tracing::info!(per_minute = config.rate_limit_per_minute, "Rate limiting enabled");
        }
        let key_cipher = KeyCipher::from_config(&config);

        Ok(Self {
            store,
            config,
            ultravox: Arc::new(ultravox),
            events,
            egress: Arc::new(egress),
            jwks: Arc::new(jwks),
            rate_limiter: Arc::new(rate_limiter),
            key_cipher: Arc::new(key_cipher),
        })
    }

    /// Publish a domain event and fan it out to subscriber endpoints.
    pub async fn publish(&self, event: DomainEvent) {
        self.events.publish(&event).await;
        self.egress.fan_out(&event).await;
    }
}
