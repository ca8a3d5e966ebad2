//! Storage layer for the Trudy backend.
//!
//! This crate provides persistence for tenants, the credit ledger, domain
//! records, idempotency records and egress webhook state.
//!
//! # Backends
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`, with embedded migrations
//! - [`MemoryStore`]: in-process maps behind a mutex, for tests and local runs
//!
//! Both backends honour the same contracts:
//!
//! - A ledger entry and the matching balance change commit together, and the
//!   `(tenant_id, type, reference_type, reference_id)` key is unique, so
//!   replaying an entry is reported as [`LedgerOutcome::Duplicate`] and changes
//!   nothing.
//! - `(tenant_id, key)` is unique for live idempotency records; the losing
//!   writer of a race gets the winner's record back.
//! - `(campaign_id, phone_number)` is unique for campaign contacts.
//! - `(tenant_id, service, key_name)` is unique for API keys.
//!
//! # Example
//!
//! ```no_run
//! use trudy_store::{MemoryStore, Store};
//! use trudy_core::{Tenant, TenantId};
//!
//! # async fn demo() -> trudy_store::Result<()> {
//! let store = MemoryStore::new();
//! let tenant = Tenant::new(TenantId::generate(), "Acme");
//! store.insert_tenant(&tenant).await?;
//! let balance = store.get_tenant(tenant.id).await?.map(|t| t.credits_balance);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use trudy_core::{
    Agent, AgentId, ApiKey, AuditEntry, Call, CallDirection, CallId, CallStatus, Campaign,
    CampaignContact, CampaignId, CampaignStats, CampaignStatus, ContactStatus, CreditLedgerEntry,
    DeliveryId, IdempotencyRecord, KnowledgeBase, KnowledgeBaseId, SubscriptionStatus, Tenant,
    TenantId, Tool, ToolId, Voice, VoiceId, WebhookDelivery, WebhookEndpoint, WebhookEndpointId,
};

/// Result of appending a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// The entry was new; the balance moved.
    Applied {
        /// Balance after the entry.
        balance: i64,
    },
    /// An entry with the same dedup key exists; nothing changed.
    Duplicate {
        /// Current balance.
        balance: i64,
    },
}

impl LedgerOutcome {
    /// Balance after the operation.
    #[must_use]
    pub const fn balance(self) -> i64 {
        match self {
            Self::Applied { balance } | Self::Duplicate { balance } => balance,
        }
    }

    /// Whether the entry was applied by this call.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Result of inserting an idempotency record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyInsert {
    /// This record is now the stored one.
    Inserted,
    /// A live record for the same `(tenant, key)` already existed.
    Exists(IdempotencyRecord),
}

/// Filters for listing calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallFilter {
    /// Only calls handled by this agent.
    pub agent_id: Option<AgentId>,
    /// Only calls in this status.
    pub status: Option<CallStatus>,
    /// Only calls in this direction.
    pub direction: Option<CallDirection>,
}

/// Filters for listing campaigns.
#[derive(Debug, Clone, Copy, Default)]
pub struct CampaignFilter {
    /// Only campaigns using this agent.
    pub agent_id: Option<AgentId>,
    /// Only campaigns in this status.
    pub status: Option<CampaignStatus>,
}

/// Offset pagination.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Maximum items returned.
    pub limit: usize,
    /// Items skipped.
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of results plus the unpaginated total.
#[derive(Debug, Clone)]
pub struct Paged<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total matching items.
    pub total: usize,
}

/// The storage trait defining all database operations.
///
/// Lookups named `get_*` are scoped to a tenant and return `None` for records
/// owned by someone else. Lookups named `find_*` are unscoped and are used by
/// webhook ingress and operator routes, where the tenant is not known up front.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Tenants
    // =========================================================================

    /// Insert a new tenant.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the ID exists.
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<()>;

    /// Get a tenant by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>>;

    /// Find the tenant linked to a Stripe customer.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_tenant_by_stripe_customer(&self, customer_id: &str) -> Result<Option<Tenant>>;

    /// Set a tenant's subscription status.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the tenant doesn't exist.
    async fn update_subscription_status(
        &self,
        tenant_id: TenantId,
        status: SubscriptionStatus,
    ) -> Result<()>;

    // =========================================================================
    // Credit Ledger
    // =========================================================================

    /// Append a ledger entry and move the cached balance in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the tenant doesn't exist.
    async fn apply_ledger_entry(&self, entry: &CreditLedgerEntry) -> Result<LedgerOutcome>;

    /// List a tenant's ledger, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_ledger_entries(
        &self,
        tenant_id: TenantId,
        page: Page,
    ) -> Result<Paged<CreditLedgerEntry>>;

    // =========================================================================
    // Calls
    // =========================================================================

    /// Insert a call.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_call(&self, call: &Call) -> Result<()>;

    /// Replace a call's mutable fields.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the call doesn't exist.
    async fn update_call(&self, call: &Call) -> Result<()>;

    /// Get a tenant's call.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_call(&self, tenant_id: TenantId, call_id: CallId) -> Result<Option<Call>>;

    /// Find a call by its provider correlation ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_call_by_ultravox_id(&self, ultravox_call_id: &str) -> Result<Option<Call>>;

    /// List a tenant's calls, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_calls(
        &self,
        tenant_id: TenantId,
        filter: CallFilter,
        page: Page,
    ) -> Result<Paged<Call>>;

    // =========================================================================
    // Agents, voices, knowledge bases, tools
    // =========================================================================

    /// Insert an agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_agent(&self, agent: &Agent) -> Result<()>;

    /// Replace an agent's mutable fields.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the agent doesn't exist.
    async fn update_agent(&self, agent: &Agent) -> Result<()>;

    /// Get a tenant's agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Option<Agent>>;

    /// List a tenant's agents, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_agents(&self, tenant_id: TenantId) -> Result<Vec<Agent>>;

    /// Insert a voice.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_voice(&self, voice: &Voice) -> Result<()>;

    /// Replace a voice's mutable fields.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the voice doesn't exist.
    async fn update_voice(&self, voice: &Voice) -> Result<()>;

    /// Get a tenant's voice.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_voice(&self, tenant_id: TenantId, voice_id: VoiceId) -> Result<Option<Voice>>;

    /// Find a voice by ID regardless of tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_voice(&self, voice_id: VoiceId) -> Result<Option<Voice>>;

    /// Find a voice by its provider correlation ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_voice_by_ultravox_id(&self, ultravox_voice_id: &str) -> Result<Option<Voice>>;

    /// List a tenant's voices, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_voices(&self, tenant_id: TenantId) -> Result<Vec<Voice>>;

    /// Insert a knowledge base.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_knowledge_base(&self, kb: &KnowledgeBase) -> Result<()>;

    /// Replace a knowledge base's mutable fields.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the knowledge base doesn't exist.
    async fn update_knowledge_base(&self, kb: &KnowledgeBase) -> Result<()>;

    /// Get a tenant's knowledge base.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_knowledge_base(
        &self,
        tenant_id: TenantId,
        kb_id: KnowledgeBaseId,
    ) -> Result<Option<KnowledgeBase>>;

    /// List a tenant's knowledge bases, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_knowledge_bases(&self, tenant_id: TenantId) -> Result<Vec<KnowledgeBase>>;

    /// Insert a tool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_tool(&self, tool: &Tool) -> Result<()>;

    /// Replace a tool's mutable fields.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the tool doesn't exist.
    async fn update_tool(&self, tool: &Tool) -> Result<()>;

    /// Get a tenant's tool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_tool(&self, tenant_id: TenantId, tool_id: ToolId) -> Result<Option<Tool>>;

    /// List a tenant's tools, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_tools(&self, tenant_id: TenantId) -> Result<Vec<Tool>>;

    /// Delete a tenant's tool. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn delete_tool(&self, tenant_id: TenantId, tool_id: ToolId) -> Result<bool>;

    // =========================================================================
    // Campaigns
    // =========================================================================

    /// Insert a campaign.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()>;

    /// Replace a campaign's mutable fields (stats excluded).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the campaign doesn't exist.
    async fn update_campaign(&self, campaign: &Campaign) -> Result<()>;

    /// Get a tenant's campaign.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_campaign(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
    ) -> Result<Option<Campaign>>;

    /// Get a campaign by ID regardless of tenant (operator and webhook paths).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>>;

    /// List a tenant's campaigns, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_campaigns(
        &self,
        tenant_id: TenantId,
        filter: CampaignFilter,
        page: Page,
    ) -> Result<Paged<Campaign>>;

    /// Delete a tenant's campaign and its contacts. Returns whether a row was
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn delete_campaign(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<bool>;

    /// Add contacts, skipping phone numbers already in the campaign.
    ///
    /// Returns the number of contacts added.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_contacts(&self, contacts: &[CampaignContact]) -> Result<usize>;

    /// List a campaign's contacts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_contacts(&self, campaign_id: CampaignId) -> Result<Vec<CampaignContact>>;

    /// Set the status of the contact with `phone_number`, and its call when
    /// given. Returns whether a contact matched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn set_contact_status(
        &self,
        campaign_id: CampaignId,
        phone_number: &str,
        status: ContactStatus,
        call_id: Option<CallId>,
    ) -> Result<bool>;

    /// Recount contacts by status and store the result on the campaign.
    ///
    /// Returns `None` if the campaign doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn recompute_campaign_stats(&self, campaign_id: CampaignId)
        -> Result<Option<CampaignStats>>;

    // =========================================================================
    // Idempotency
    // =========================================================================

    /// Get the record for `(tenant, key)`, expired or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_idempotency_record(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Store a record unless a live one holds the key.
    ///
    /// An expired record holding the key is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_idempotency_record(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<IdempotencyInsert>;

    /// Delete records expired at `now`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64>;

    // =========================================================================
    // Webhook endpoints and deliveries
    // =========================================================================

    /// Insert an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()>;

    /// Replace an endpoint's mutable fields.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the endpoint doesn't exist.
    async fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()>;

    /// Get a tenant's endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_endpoint(
        &self,
        tenant_id: TenantId,
        endpoint_id: WebhookEndpointId,
    ) -> Result<Option<WebhookEndpoint>>;

    /// Find an endpoint by ID regardless of tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_endpoint(&self, endpoint_id: WebhookEndpointId)
        -> Result<Option<WebhookEndpoint>>;

    /// List a tenant's endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_endpoints(&self, tenant_id: TenantId) -> Result<Vec<WebhookEndpoint>>;

    /// Enabled endpoints of `tenant_id` subscribed to `event_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_subscribed_endpoints(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>>;

    /// Delete a tenant's endpoint. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn delete_endpoint(
        &self,
        tenant_id: TenantId,
        endpoint_id: WebhookEndpointId,
    ) -> Result<bool>;

    /// Insert a delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    /// Replace a delivery's mutable fields.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the delivery doesn't exist.
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    /// Get a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_delivery(&self, delivery_id: DeliveryId) -> Result<Option<WebhookDelivery>>;

    /// Deliveries a retry sweep should pick up, oldest first: every `failed`
    /// delivery, plus `pending` ones whose next attempt (or creation, when
    /// none is scheduled) is at or before `stranded_before`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_retryable_deliveries(
        &self,
        stranded_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>>;

    // =========================================================================
    // Audit log
    // =========================================================================

    /// Append an audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()>;

    /// List a tenant's audit entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_audit_entries(&self, tenant_id: TenantId, page: Page)
        -> Result<Paged<AuditEntry>>;

    // =========================================================================
    // API keys
    // =========================================================================

    /// Insert an API key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the tenant already has a key with the
    /// same service and name.
    async fn insert_api_key(&self, key: &ApiKey) -> Result<()>;

    /// Replace a key's material, settings and active flag.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the key doesn't exist.
    async fn update_api_key(&self, key: &ApiKey) -> Result<()>;

    /// The tenant's oldest key for `service`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_api_key_for_service(
        &self,
        tenant_id: TenantId,
        service: &str,
    ) -> Result<Option<ApiKey>>;

    /// List a tenant's keys, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_api_keys(&self, tenant_id: TenantId) -> Result<Vec<ApiKey>>;
}
