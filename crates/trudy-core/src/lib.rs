//! Core types and utilities for the Trudy backend.
//!
//! This crate provides the foundational types shared by the store and the
//! HTTP service:
//!
//! - **Identifiers**: `TenantId`, `CallId`, `AgentId`, `LedgerEntryId`, ...
//! - **Tenants**: `Tenant`, `SubscriptionStatus`
//! - **Ledger**: `CreditLedgerEntry`, `LedgerEntryType`, `ReferenceType`
//! - **Domain records**: `Call`, `Campaign`, `CampaignContact`, `Agent`,
//!   `Voice`, `KnowledgeBase`, `Tool`
//! - **Idempotency**: `CanonicalRequest`, `IdempotencyRecord`
//! - **Webhooks**: `WebhookEndpoint`, `WebhookDelivery`, `EventEnvelope`
//! - **Audit and secrets**: `AuditEntry`, `ApiKey`
//!
//! # Credit Unit
//!
//! **1 credit = 1 call minute = $1**
//!
//! - A payment of $25.00 (2500 cents) buys 25 credits
//! - A 125 second call is billed `ceil(125 / 60) = 3` credits
//! - Balances are `i64` and may go negative when a completed call is billed
//!   against an exhausted balance

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
mod macros;

pub mod api_key;
pub mod audit;
pub mod call;
pub mod campaign;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod ids;
pub mod ledger;
pub mod resources;
pub mod tenant;
pub mod webhook;

pub use api_key::{ApiKey, TtsProvider};
pub use audit::{field_diff, AuditAction, AuditEntry};
pub use call::{Call, CallDirection, CallStatus};
pub use campaign::{
    is_e164, Campaign, CampaignContact, CampaignStats, CampaignStatus, ContactStatus, NewContact,
    ScheduleType,
};
pub use error::{DomainError, Result};
pub use events::{DomainEvent, EventType};
pub use idempotency::{
    CachedResponse, CanonicalRequest, IdempotencyCheck, IdempotencyRecord,
    DEFAULT_IDEMPOTENCY_TTL_DAYS, EXCLUDED_HEADERS,
};
pub use ids::{
    AgentId, ApiKeyId, AuditEntryId, CallId, CampaignId, ContactId, DeliveryId, IdError,
    KnowledgeBaseId, LedgerEntryId, TenantId, ToolId, VoiceId, WebhookEndpointId,
};
pub use ledger::{
    balance_of, billed_minutes, call_duration_seconds, credits_for_cents, CreditLedgerEntry,
    LedgerEntryType, ReferenceType, MAX_CALL_DURATION_SECONDS, NATIVE_VOICE_TRAINING_CREDITS,
};
pub use resources::{
    Agent, AgentStatus, KnowledgeBase, KnowledgeBaseStatus, Tool, ToolStatus, Voice,
    VoiceStatus, VoiceStrategy,
};
pub use tenant::{Role, SubscriptionStatus, Tenant};
pub use webhook::{
    DeliveryStatus, EventEnvelope, WebhookDelivery, WebhookEndpoint,
    DEFAULT_DELIVERY_MAX_ATTEMPTS,
};
