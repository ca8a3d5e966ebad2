//! Service configuration.

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

/// How egress deliveries are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EgressMode {
    /// Hand deliveries to the background worker, which retries with backoff.
    #[default]
    Queued,
    /// Attempt each delivery once inside the request that produced the event.
    Inline,
}

impl FromStr for EgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "inline" => Ok(Self::Inline),
            other => Err(format!("unknown egress mode: {other}")),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// PostgreSQL URL. When absent the in-memory store is used.
    pub database_url: Option<String>,

    /// Pool size for PostgreSQL.
    pub database_max_connections: u32,

    /// JWT issuer; JWKS is fetched from `{issuer}/.well-known/jwks.json`.
    pub auth_issuer: String,

    /// Expected JWT audience.
    pub auth_audience: String,

    /// Shared HS256 secret. When set, tokens are validated with it instead of JWKS.
    pub auth_hs256_secret: Option<String>,

    /// Serve the previous JWKS when a refresh fails.
    pub jwks_serve_stale: bool,

    /// Key expected in `X-Internal-Key` on operator routes.
    pub internal_api_key: Option<String>,

    /// Ultravox API base URL.
    pub ultravox_base_url: String,

    /// Ultravox API key.
    pub ultravox_api_key: String,

    /// Shared secret for Ultravox webhook signatures.
    pub ultravox_webhook_secret: Option<String>,

    /// Stripe webhook signing secret.
    pub stripe_webhook_secret: Option<String>,

    /// Oldest accepted webhook timestamp, in seconds.
    pub webhook_max_age_seconds: i64,

    /// Lifetime of idempotency records.
    pub idempotency_ttl_days: i64,

    /// Treat an unreachable idempotency store as a miss.
    pub idempotency_fail_open: bool,

    /// Egress delivery mode.
    pub egress_mode: EgressMode,

    /// Timeout for a single egress delivery.
    pub egress_timeout_seconds: u64,

    /// Timeout for a single Ultravox request.
    pub provider_timeout_seconds: u64,

    /// Attempts per Ultravox request, including the first.
    pub provider_max_attempts: u32,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Enforce the per-client request limit on `/v1` routes.
    pub rate_limit_enabled: bool,

    /// Requests allowed per client and path per minute.
    pub rate_limit_per_minute: u32,

    /// Base64 AES-256 key sealing tenant API keys at rest.
    pub api_key_encryption_key: Option<String>,

    /// Store API keys as plaintext when no encryption key is usable.
    pub api_key_encryption_fail_open: bool,
}

/// Ultravox secrets file structure.
#[derive(Debug, Deserialize)]
struct UltravoxSecrets {
    api_key: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
}

/// Stripe secrets file structure.
#[derive(Debug, Deserialize)]
struct StripeSecrets {
    webhook_secret: String,
}

const ULTRAVOX_SECRET_PATHS: &[&str] = &[".secrets/ultravox.json", "../.secrets/ultravox.json"];
const STRIPE_SECRET_PATHS: &[&str] = &[".secrets/stripe.json", "../.secrets/stripe.json"];

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let (ultravox_api_key, ultravox_base_url, ultravox_webhook_secret) =
            load_ultravox_secrets(ULTRAVOX_SECRET_PATHS);

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            auth_issuer: std::env::var("AUTH_ISSUER").unwrap_or(defaults.auth_issuer),
            auth_audience: std::env::var("AUTH_AUDIENCE").unwrap_or(defaults.auth_audience),
            auth_hs256_secret: std::env::var("AUTH_HS256_SECRET").ok(),
            jwks_serve_stale: env_bool("JWKS_SERVE_STALE").unwrap_or(defaults.jwks_serve_stale),
            internal_api_key: std::env::var("INTERNAL_API_KEY").ok(),
            ultravox_base_url: ultravox_base_url.unwrap_or(defaults.ultravox_base_url),
            ultravox_api_key: ultravox_api_key.unwrap_or_default(),
            ultravox_webhook_secret,
            stripe_webhook_secret: load_stripe_secret(STRIPE_SECRET_PATHS),
            webhook_max_age_seconds: env_parse("WEBHOOK_MAX_AGE_SECONDS")
                .unwrap_or(defaults.webhook_max_age_seconds),
            idempotency_ttl_days: env_parse("IDEMPOTENCY_TTL_DAYS")
                .unwrap_or(defaults.idempotency_ttl_days),
            idempotency_fail_open: env_bool("IDEMPOTENCY_FAIL_OPEN")
                .unwrap_or(defaults.idempotency_fail_open),
            egress_mode: env_parse("EGRESS_MODE").unwrap_or(defaults.egress_mode),
            egress_timeout_seconds: env_parse("EGRESS_TIMEOUT_SECONDS")
                .unwrap_or(defaults.egress_timeout_seconds),
            provider_timeout_seconds: env_parse("PROVIDER_TIMEOUT_SECONDS")
                .unwrap_or(defaults.provider_timeout_seconds),
            provider_max_attempts: env_parse("PROVIDER_MAX_ATTEMPTS")
                .unwrap_or(defaults.provider_max_attempts),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout_seconds),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED")
                .unwrap_or(defaults.rate_limit_enabled),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE")
                .unwrap_or(defaults.rate_limit_per_minute),
            api_key_encryption_key: std::env::var("API_KEY_ENCRYPTION_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            api_key_encryption_fail_open: env_bool("API_KEY_ENCRYPTION_FAIL_OPEN")
                .unwrap_or(defaults.api_key_encryption_fail_open),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|s| parse_bool(&s))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load Ultravox credentials from file or environment.
fn load_ultravox_secrets(paths: &[&str]) -> (Option<String>, Option<String>, Option<String>) {
    for path in paths {
        if let Ok(secrets) = load_secrets_file::<UltravoxSecrets>(Path::new(path)) {
            tracing::info!(path = %path, "Loaded Ultravox secrets from file");
            return (
                Some(secrets.api_key),
                secrets.base_url,
                secrets.webhook_secret,
            );
        }
    }

    tracing::debug!("Ultravox secrets file not found, using environment variables");
    (
        std::env::var("ULTRAVOX_API_KEY").ok(),
        std::env::var("ULTRAVOX_BASE_URL").ok(),
        std::env::var("ULTRAVOX_WEBHOOK_SECRET").ok(),
    )
}

/// Load the Stripe webhook secret from file or environment.
fn load_stripe_secret(paths: &[&str]) -> Option<String> {
    for path in paths {
        if let Ok(secrets) = load_secrets_file::<StripeSecrets>(Path::new(path)) {
            tracing::info!(path = %path, "Loaded Stripe secrets from file");
            return Some(secrets.webhook_secret);
        }
    }

    std::env::var("STRIPE_WEBHOOK_SECRET").ok()
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, std::io::Error> {
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: None,
            database_max_connections: 10,
            auth_issuer: "https://auth.trudy.ai".into(),
            auth_audience: "trudy-api".into(),
            auth_hs256_secret: None,
            jwks_serve_stale: true,
            internal_api_key: None,
            ultravox_base_url: "https://api.ultravox.ai/api".into(),
            ultravox_api_key: String::new(),
            ultravox_webhook_secret: None,
            stripe_webhook_secret: None,
            webhook_max_age_seconds: 300,
            idempotency_ttl_days: trudy_core::DEFAULT_IDEMPOTENCY_TTL_DAYS,
            idempotency_fail_open: true,
            egress_mode: EgressMode::Queued,
            egress_timeout_seconds: 10,
            provider_timeout_seconds: 30,
            provider_max_attempts: 5,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            rate_limit_enabled: true,
            rate_limit_per_minute: 100,
            api_key_encryption_key: None,
            api_key_encryption_fail_open: true,
        }
    }
}
