//! Per-client rate limiting for the tenant API.
//!
//! Requests are counted per `(client, path)` in fixed one-minute windows
//! aligned to the wall clock. The client is the `X-Client-Id` header when
//! present, otherwise the peer address, otherwise `anonymous`. Counters live
//! in process memory, so each replica enforces its own limit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, TimeZone, Utc};

use crate::auth::CLIENT_ID_HEADER;
use crate::error::ApiError;
use crate::state::AppState;

/// Window length in seconds.
const WINDOW_SECONDS: i64 = 60;

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Within the limit.
    Allowed {
        /// Requests left in this window.
        remaining: u32,
    },
    /// Over the limit until `reset_at`.
    Limited {
        /// Start of the next window.
        reset_at: DateTime<Utc>,
    },
}

/// Fixed-window request counter.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    counters: Mutex<HashMap<(String, String), Counter>>,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    window: i64,
    count: u32,
}

impl RateLimiter {
    /// A limiter allowing `limit` requests per client and path per minute.
    #[must_use]
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Requests allowed per window.
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Count a request from `client` to `path` at `now`.
    pub fn check(&self, client: &str, path: &str, now: DateTime<Utc>) -> Decision {
        let window = now.timestamp().div_euclid(WINDOW_SECONDS);
        // A panic elsewhere leaves plain counters behind; keep using them.
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counters.retain(|_, c| c.window == window);

        let counter = counters
            .entry((client.to_string(), path.to_string()))
            .or_insert(Counter { window, count: 0 });
        counter.count = counter.count.saturating_add(1);

        if counter.count > self.limit {
            let reset_at = Utc
                .timestamp_opt((window + 1) * WINDOW_SECONDS, 0)
                .single()
                .unwrap_or(now);
            Decision::Limited { reset_at }
        } else {
            Decision::Allowed {
                remaining: self.limit - counter.count,
            }
        }
    }
}

/// Who a request is counted against.
fn client_key(request: &Request) -> String {
    if let Some(client) = request
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return format!("client:{client}");
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(
            || "anonymous".to_string(),
            |ConnectInfo(addr)| format!("ip:{}", addr.ip()),
        )
}

/// Middleware rejecting requests over the per-minute limit with 429.
pub async fn enforce(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.rate_limit_enabled {
        return next.run(request).await;
    }

    let client = client_key(&request);
    let path = request.uri().path().to_string();
    match state.rate_limiter.check(&client, &path, Utc::now()) {
        Decision::Allowed { .. } => next.run(request).await,
        Decision::Limited { reset_at } => {
            tracing::warn!(client = %client, path = %path, "Rate limit exceeded");
            ApiError::RateLimitExceeded {
                limit: state.rate_limiter.limit(),
                reset_at,
            }
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().unwrap()
    }

    #[test]
    fn limit_applies_per_client_and_path() {
        let limiter = RateLimiter::per_minute(2);
        let now = at(1_700_000_040);

        assert_eq!(
            limiter.check("a", "/v1/calls", now),
            Decision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check("a", "/v1/calls", now),
            Decision::Allowed { remaining: 0 }
        );
        assert_eq!(
            limiter.check("a", "/v1/calls", now),
            Decision::Limited {
                reset_at: at(1_700_000_100)
            }
        );
        assert!(matches!(
            limiter.check("a", "/v1/agents", now),
            Decision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("b", "/v1/calls", now),
            Decision::Allowed { .. }
        ));
    }

    #[test]
    fn counters_reset_with_the_next_window() {
        let limiter = RateLimiter::per_minute(1);
        limiter.check("a", "/v1/calls", at(1_700_000_099));
        assert!(matches!(
            limiter.check("a", "/v1/calls", at(1_700_000_099)),
            Decision::Limited { .. }
        ));
        assert_eq!(
            limiter.check("a", "/v1/calls", at(1_700_000_100)),
            Decision::Allowed { remaining: 0 }
        );
    }

    #[test]
    fn client_falls_back_to_peer_address() {
        let mut request = Request::new(Body::empty());
        assert_eq!(client_key(&request), "anonymous");

        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 4100))));
        assert_eq!(client_key(&request), "ip:10.0.0.7");

        request
            .headers_mut()
            .insert(CLIENT_ID_HEADER, "tenant-1".parse().unwrap());
        assert_eq!(client_key(&request), "client:tenant-1");
    }
}
