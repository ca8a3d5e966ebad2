//! Trudy HTTP API Service.
//!
//! This crate provides the HTTP API for the Trudy voice-AI backend, including:
//!
//! - Calls, campaigns, agents, voices, knowledge bases and tools, mirrored to
//!   Ultravox
//! - Prepaid credit balance and ledger
//! - Idempotent creation endpoints (`X-Idempotency-Key`)
//! - Signed Ultravox/Stripe webhook ingress, reconciled at most once
//! - Signed egress webhooks to tenant endpoints, with retries
//! - Tenant API keys sealed at rest, and an audit log of tenant mutations
//! - Per-client rate limiting on the tenant API
//! - Operator maintenance endpoints
//!
//! # Authentication
//!
//! The service supports two authentication methods:
//!
//! 1. **JWT bearer tokens** - For tenant requests, scoped by `X-Client-ID`
//! 2. **Internal API key** - For operator requests (`X-Internal-Key`)

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers are async for the router

pub mod audit;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod handlers;
pub mod idempotency;
pub mod rate_limit;
pub mod retry;
pub mod routes;
pub mod secrets;
pub mod state;
pub mod ultravox;
pub mod webhooks;

pub use config::{EgressMode, ServiceConfig};
pub use error::ApiError;
pub use events::{EventBus, MemoryEventBus, TracingEventBus};
pub use routes::create_router;
pub use state::AppState;
pub use ultravox::{UltravoxClient, UltravoxError};
