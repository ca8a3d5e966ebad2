//! Authentication and authorization extractors.
//!
//! This module provides extractors for:
//! - `AuthUser` - Tenant members authenticated by a bearer JWT
//! - `Require<C>` - An `AuthUser` whose role grants capability `C`
//! - `InternalAuth` - Operator routes authenticated by `X-Internal-Key`

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use trudy_core::{Role, TenantId};

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// Constants
// ============================================================================

/// How long to cache JWKS keys before refreshing.
const JWKS_CACHE_DURATION: Duration = Duration::from_secs(3600);

/// Timeout for JWKS fetch requests.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Header naming the tenant a request acts for.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Header carrying the operator key.
pub const INTERNAL_KEY_HEADER: &str = "x-internal-key";

// ============================================================================
// AuthUser
// ============================================================================

/// A tenant member authenticated by a bearer JWT.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The raw subject claim.
    pub subject: String,
    /// The tenant this request acts for.
    pub tenant_id: TenantId,
    /// The caller's role.
    pub role: Role,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let token = parts
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;

            let claims = validate_jwt(token, state).await?;

            let role = match claims.role.as_deref() {
                None => Role::default(),
                Some(role) => role
                    .parse()
                    .map_err(|_| ApiError::Unauthorized(format!("Unknown role: {role}")))?,
            };

            let header = parts
                .headers
                .get(CLIENT_ID_HEADER)
                .and_then(|v| v.to_str().ok());
            let tenant_id = resolve_tenant(role, claims.client_id.as_deref(), header)?;

            Ok(AuthUser {
                subject: claims.sub,
                tenant_id,
                role,
            })
        })
    }
}

/// Decide which tenant a request acts for.
///
/// Members of a tenant must name their own tenant in `X-Client-Id`. Agency
/// admins may name any tenant and default to their own.
fn resolve_tenant(
    role: Role,
    claim: Option<&str>,
    header: Option<&str>,
) -> Result<TenantId, ApiError> {
    let chosen = if role == Role::AgencyAdmin {
        header.or(claim)
    } else {
        let header =
            header.ok_or_else(|| ApiError::Unauthorized("X-Client-Id header required".into()))?;
        let claim =
            claim.ok_or_else(|| ApiError::Unauthorized("Token carries no client_id".into()))?;
        if header != claim {
            return Err(ApiError::Forbidden("Client ID mismatch".into()));
        }
        Some(claim)
    };

    chosen
        .ok_or_else(|| ApiError::Unauthorized("No client selected".into()))?
        .parse()
        .map_err(|_| ApiError::Unauthorized("Invalid client ID".into()))
}

// ============================================================================
// Capabilities
// ============================================================================

/// A permission granted to a fixed set of roles.
pub trait Capability: Send + Sync + 'static {
    /// Name used in rejection messages.
    const NAME: &'static str;
    /// Roles holding the capability.
    const ALLOWED: &'static [Role];
}

/// Create, change or delete a tenant's agents, voices, knowledge bases,
/// tools, campaigns and webhook endpoints.
#[derive(Debug)]
pub struct Manage;

impl Capability for Manage {
    const NAME: &'static str = "manage";
    const ALLOWED: &'static [Role] = &[Role::ClientAdmin, Role::AgencyAdmin];
}

/// An [`AuthUser`] whose role holds capability `C`.
#[derive(Debug)]
pub struct Require<C> {
    /// The authenticated user.
    pub user: AuthUser,
    _capability: PhantomData<C>,
}

impl<C> Deref for Require<C> {
    type Target = AuthUser;

    fn deref(&self) -> &AuthUser {
        &self.user
    }
}

impl<C: Capability> FromRequestParts<Arc<AppState>> for Require<C> {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let user = AuthUser::from_request_parts(parts, state).await?;
            if !C::ALLOWED.contains(&user.role) {
                tracing::debug!(
                    subject = %user.subject,
                    role = %user.role,
                    capability = C::NAME,
                    "Capability denied"
                );
                return Err(ApiError::Forbidden("Insufficient permissions".into()));
            }
            Ok(Require {
                user,
                _capability: PhantomData,
            })
        })
    }
}

// ============================================================================
// InternalAuth
// ============================================================================

/// Operator authentication via `X-Internal-Key`.
///
/// Rejects every request when no key is configured.
#[derive(Debug, Clone, Copy)]
pub struct InternalAuth;

impl FromRequestParts<Arc<AppState>> for InternalAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let expected = state.config.internal_api_key.as_deref().ok_or_else(|| {
                tracing::warn!("INTERNAL_API_KEY not configured - rejecting internal request");
                ApiError::Unauthorized("Invalid internal API key".into())
            })?;

            let provided = parts
                .headers
                .get(INTERNAL_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ApiError::Unauthorized("Invalid internal API key".into()))?;

            if !constant_time_eq(provided, expected) {
                return Err(ApiError::Unauthorized("Invalid internal API key".into()));
            }
            Ok(InternalAuth)
        })
    }
}

// ============================================================================
// JWT validation
// ============================================================================

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Tenant the user belongs to.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Role; `client_user` when absent.
    #[serde(default)]
    pub role: Option<String>,
    /// Audience (can be string or array).
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Issuer.
    pub iss: String,
    /// Expiration time.
    pub exp: i64,
    /// Issued at.
    #[serde(default)]
    pub iat: Option<i64>,
}

async fn validate_jwt(token: &str, state: &AppState) -> Result<JwtClaims, ApiError> {
    let config = &state.config;

    let (key, mut validation) = if let Some(secret) = &config.auth_hs256_secret {
        (
            DecodingKey::from_secret(secret.as_bytes()),
            Validation::new(Algorithm::HS256),
        )
    } else {
        let header = decode_header(token).map_err(|e| {
            tracing::debug!(error = %e, "Failed to decode JWT header");
            ApiError::Unauthorized("Invalid token".into())
        })?;
        (
            state.jwks.key_for(header.kid.as_deref()).await?,
            Validation::new(Algorithm::RS256),
        )
    };
    validation.set_audience(&[&config.auth_audience]);
    validation.set_issuer(&[&config.auth_issuer]);

    decode::<JwtClaims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            ApiError::Unauthorized("Invalid token".into())
        })
}

// ============================================================================
// JWKS cache
// ============================================================================

/// JWKS (JSON Web Key Set) response structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    /// List of JWK keys.
    pub keys: Vec<Jwk>,
}

/// Single JSON Web Key.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA").
    pub kty: String,
    /// Key ID.
    pub kid: Option<String>,
    /// RSA public key modulus (base64url encoded).
    pub n: Option<String>,
    /// RSA public key exponent (base64url encoded).
    pub e: Option<String>,
}

#[derive(Default)]
struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    default_key: Option<DecodingKey>,
    fetched_at: Option<Instant>,
}

impl CachedKeys {
    fn is_fresh(&self) -> bool {
        self.fetched_at
            .is_some_and(|at| at.elapsed() < JWKS_CACHE_DURATION)
    }

    fn lookup(&self, kid: Option<&str>) -> Option<DecodingKey> {
        match kid {
            Some(kid) => self.keys.get(kid).cloned(),
            None => self.default_key.clone(),
        }
    }
}

/// Signing keys fetched from `{issuer}/.well-known/jwks.json`, cached for an
/// hour. When `serve_stale` is set, a failed refresh falls back to the keys
/// already held.
pub struct JwksCache {
    client: reqwest::Client,
    url: String,
    serve_stale: bool,
    cached: RwLock<CachedKeys>,
}

impl JwksCache {
    /// Create an empty cache for `issuer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(issuer: &str, serve_stale: bool) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/')),
            serve_stale,
            cached: RwLock::new(CachedKeys::default()),
        })
    }

    /// Key for `kid`, or the first key when the token names none.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for an unknown key and `Provider` when the set
    /// cannot be fetched and no usable stale copy exists.
    pub async fn key_for(&self, kid: Option<&str>) -> Result<DecodingKey, ApiError> {
        {
            let cached = self.cached.read().await;
            if cached.is_fresh() {
                if let Some(key) = cached.lookup(kid) {
                    return Ok(key);
                }
            }
        }

        let mut cached = self.cached.write().await;
        match self.fetch().await {
            Ok(jwks) => {
                cached.keys.clear();
                cached.default_key = None;
                cached.fetched_at = Some(Instant::now());
                for jwk in &jwks.keys {
                    if let Some(key) = jwk_to_decoding_key(jwk) {
                        if let Some(kid) = &jwk.kid {
                            cached.keys.insert(kid.clone(), key.clone());
                        }
                        if cached.default_key.is_none() {
                            cached.default_key = Some(key);
                        }
                    }
                }
            }
            Err(e) if self.serve_stale && cached.fetched_at.is_some() => {
                tracing::warn!(error = %e, "JWKS refresh failed - serving stale keys");
            }
            Err(e) => return Err(e),
        }

        cached
            .lookup(kid)
            .ok_or_else(|| ApiError::Unauthorized("Unknown signing key".into()))
    }

    async fn fetch(&self) -> Result<Jwks, ApiError> {
        tracing::debug!(url = %self.url, "Fetching JWKS");

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            tracing::error!(error = %e, url = %self.url, "Failed to fetch JWKS");
            ApiError::Provider("Failed to fetch authentication keys".into())
        })?;

        if !response.status().is_success() {
            tracing::error!(
                status = %response.status(),
                url = %self.url,
                "JWKS fetch returned non-success status"
            );
            return Err(ApiError::Provider(
                "Failed to fetch authentication keys".into(),
            ));
        }

        let jwks: Jwks = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse JWKS response");
            ApiError::Provider("Failed to parse authentication keys".into())
        })?;

        tracing::info!(keys_count = %jwks.keys.len(), "JWKS fetched successfully");
        Ok(jwks)
    }
}

fn jwk_to_decoding_key(jwk: &Jwk) -> Option<DecodingKey> {
    if jwk.kty != "RSA" {
        tracing::debug!(kty = %jwk.kty, "Skipping non-RSA JWK");
        return None;
    }
    DecodingKey::from_rsa_components(jwk.n.as_ref()?, jwk.e.as_ref()?).ok()
}
