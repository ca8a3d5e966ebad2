//! PostgreSQL storage implementation.
//!
//! Queries are built at runtime (no compile-time checked macros) so the crate
//! builds without a database. Rows are read into `FromRow` structs that mirror
//! the tables and converted to domain types in one place per table; enum
//! columns are stored as their wire strings.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use trudy_core::{
    Agent, AgentId, ApiKey, ApiKeyId, AuditEntry, Call, CallId, Campaign, CampaignContact,
    CampaignId, CampaignStats, ContactId, ContactStatus, CreditLedgerEntry, DeliveryId,
    IdempotencyRecord, KnowledgeBase, KnowledgeBaseId, SubscriptionStatus, Tenant, TenantId, Tool,
    ToolId, Voice, VoiceId, WebhookDelivery, WebhookEndpoint, WebhookEndpointId,
};

use crate::error::{Result, StoreError};
use crate::{
    CallFilter, CampaignFilter, IdempotencyInsert, LedgerOutcome, Page, Paged, Store,
};

/// PostgreSQL-backed storage.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect, then apply the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable or a migration fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(max_connections, "PostgreSQL store ready");

        Ok(Self { pool })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or_default()
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    credits_balance: i64,
    subscription_status: String,
    stripe_customer_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = StoreError;

    fn try_from(row: TenantRow) -> Result<Self> {
        Ok(Self {
            id: TenantId::from_inner(row.id),
            name: row.name,
            credits_balance: row.credits_balance,
            subscription_status: row.subscription_status.parse()?,
            stripe_customer_id: row.stripe_customer_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LedgerRow {
    id: String,
    tenant_id: Uuid,
    #[sqlx(rename = "type")]
    entry_type: String,
    amount: i64,
    reference_type: String,
    reference_id: String,
    description: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for CreditLedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        Ok(Self {
            id: row.id.parse()?,
            tenant_id: TenantId::from_inner(row.tenant_id),
            entry_type: row.entry_type.parse()?,
            amount: row.amount,
            reference_type: row.reference_type.parse()?,
            reference_id: row.reference_id,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CallRow {
    id: Uuid,
    tenant_id: Uuid,
    agent_id: Uuid,
    ultravox_call_id: Option<String>,
    phone_number: String,
    direction: String,
    status: String,
    context: Value,
    call_settings: Value,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    cost_usd: Option<f64>,
    recording_url: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CallRow> for Call {
    type Error = StoreError;

    fn try_from(row: CallRow) -> Result<Self> {
        Ok(Self {
            id: CallId::from_inner(row.id),
            tenant_id: TenantId::from_inner(row.tenant_id),
            agent_id: AgentId::from_inner(row.agent_id),
            ultravox_call_id: row.ultravox_call_id,
            phone_number: row.phone_number,
            direction: row.direction.parse()?,
            status: row.status.parse()?,
            context: row.context,
            call_settings: row.call_settings,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_seconds: row.duration_seconds,
            cost_usd: row.cost_usd,
            recording_url: row.recording_url,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AgentRow {
    id: Uuid,
    tenant_id: Uuid,
    ultravox_agent_id: Option<String>,
    name: String,
    description: Option<String>,
    voice_id: Uuid,
    system_prompt: String,
    model: String,
    tools: Value,
    knowledge_bases: Value,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = StoreError;

    fn try_from(row: AgentRow) -> Result<Self> {
        Ok(Self {
            id: AgentId::from_inner(row.id),
            tenant_id: TenantId::from_inner(row.tenant_id),
            ultravox_agent_id: row.ultravox_agent_id,
            name: row.name,
            description: row.description,
            voice_id: VoiceId::from_inner(row.voice_id),
            system_prompt: row.system_prompt,
            model: row.model,
            tools: serde_json::from_value(row.tools)?,
            knowledge_bases: serde_json::from_value(row.knowledge_bases)?,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct VoiceRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    provider: String,
    voice_type: String,
    language: String,
    status: String,
    training_info: Value,
    ultravox_voice_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<VoiceRow> for Voice {
    type Error = StoreError;

    fn try_from(row: VoiceRow) -> Result<Self> {
        Ok(Self {
            id: VoiceId::from_inner(row.id),
            tenant_id: TenantId::from_inner(row.tenant_id),
            name: row.name,
            provider: row.provider,
            voice_type: row.voice_type,
            language: row.language,
            status: row.status.parse()?,
            training_info: row.training_info,
            ultravox_voice_id: row.ultravox_voice_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct KnowledgeBaseRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    description: Option<String>,
    language: String,
    ultravox_corpus_id: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<KnowledgeBaseRow> for KnowledgeBase {
    type Error = StoreError;

    fn try_from(row: KnowledgeBaseRow) -> Result<Self> {
        Ok(Self {
            id: KnowledgeBaseId::from_inner(row.id),
            tenant_id: TenantId::from_inner(row.tenant_id),
            name: row.name,
            description: row.description,
            language: row.language,
            ultravox_corpus_id: row.ultravox_corpus_id,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ToolRow {
    id: Uuid,
    tenant_id: Uuid,
    ultravox_tool_id: Option<String>,
    name: String,
    description: Option<String>,
    category: Option<String>,
    endpoint: String,
    method: String,
    authentication: Value,
    parameters: Value,
    response_schema: Value,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ToolRow> for Tool {
    type Error = StoreError;

    fn try_from(row: ToolRow) -> Result<Self> {
        Ok(Self {
            id: ToolId::from_inner(row.id),
            tenant_id: TenantId::from_inner(row.tenant_id),
            ultravox_tool_id: row.ultravox_tool_id,
            name: row.name,
            description: row.description,
            category: row.category,
            endpoint: row.endpoint,
            method: row.method,
            authentication: row.authentication,
            parameters: row.parameters,
            response_schema: row.response_schema,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CampaignRow {
    id: Uuid,
    tenant_id: Uuid,
    agent_id: Uuid,
    name: String,
    schedule_type: String,
    scheduled_at: Option<DateTime<Utc>>,
    timezone: String,
    max_concurrent_calls: i32,
    status: String,
    ultravox_batch_ids: Value,
    stats: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = StoreError;

    fn try_from(row: CampaignRow) -> Result<Self> {
        Ok(Self {
            id: CampaignId::from_inner(row.id),
            tenant_id: TenantId::from_inner(row.tenant_id),
            agent_id: AgentId::from_inner(row.agent_id),
            name: row.name,
            schedule_type: row.schedule_type.parse()?,
            scheduled_at: row.scheduled_at,
            timezone: row.timezone,
            max_concurrent_calls: to_u32(row.max_concurrent_calls),
            status: row.status.parse()?,
            ultravox_batch_ids: serde_json::from_value(row.ultravox_batch_ids)?,
            stats: serde_json::from_value(row.stats)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ContactRow {
    id: Uuid,
    campaign_id: Uuid,
    phone_number: String,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    custom_fields: Value,
    status: String,
    call_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ContactRow> for CampaignContact {
    type Error = StoreError;

    fn try_from(row: ContactRow) -> Result<Self> {
        Ok(Self {
            id: ContactId::from_inner(row.id),
            campaign_id: CampaignId::from_inner(row.campaign_id),
            phone_number: row.phone_number,
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            custom_fields: row.custom_fields,
            status: row.status.parse()?,
            call_id: row.call_id.map(CallId::from_inner),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct IdempotencyRow {
    tenant_id: Uuid,
    key: String,
    request_fingerprint: String,
    status_code: i32,
    response_body: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        Self {
            tenant_id: TenantId::from_inner(row.tenant_id),
            key: row.key,
            request_fingerprint: row.request_fingerprint,
            response: trudy_core::CachedResponse {
                status_code: u16::try_from(row.status_code).unwrap_or(500),
                body: row.response_body,
            },
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct EndpointRow {
    id: Uuid,
    tenant_id: Uuid,
    url: String,
    event_types: Value,
    secret: String,
    enabled: bool,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EndpointRow> for WebhookEndpoint {
    type Error = StoreError;

    fn try_from(row: EndpointRow) -> Result<Self> {
        Ok(Self {
            id: WebhookEndpointId::from_inner(row.id),
            tenant_id: TenantId::from_inner(row.tenant_id),
            url: row.url,
            event_types: serde_json::from_value(row.event_types)?,
            secret: row.secret,
            enabled: row.enabled,
            max_attempts: to_u32(row.max_attempts),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: Uuid,
    endpoint_id: Uuid,
    tenant_id: Uuid,
    event_type: String,
    payload: Value,
    status: String,
    attempt: i32,
    response_code: Option<i32>,
    error_message: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        Ok(Self {
            id: DeliveryId::from_inner(row.id),
            endpoint_id: WebhookEndpointId::from_inner(row.endpoint_id),
            tenant_id: TenantId::from_inner(row.tenant_id),
            event_type: row.event_type,
            payload: serde_json::from_value(row.payload)?,
            status: row.status.parse()?,
            attempt: to_u32(row.attempt),
            response_code: row.response_code.and_then(|c| u16::try_from(c).ok()),
            error_message: row.error_message,
            next_attempt_at: row.next_attempt_at,
            delivered_at: row.delivered_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: String,
    tenant_id: Uuid,
    user_id: Option<String>,
    action: String,
    table_name: String,
    record_id: String,
    diff: Value,
    metadata: Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(Self {
            id: row.id.parse()?,
            tenant_id: TenantId::from_inner(row.tenant_id),
            user_id: row.user_id,
            action: row.action.parse()?,
            table_name: row.table_name,
            record_id: row.record_id,
            diff: row.diff,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ApiKeyRow {
    id: Uuid,
    tenant_id: Uuid,
    service: String,
    key_name: String,
    encrypted_key: String,
    encrypted: bool,
    settings: Value,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        Self {
            id: ApiKeyId::from_inner(row.id),
            tenant_id: TenantId::from_inner(row.tenant_id),
            service: row.service,
            key_name: row.key_name,
            encrypted_key: row.encrypted_key,
            encrypted: row.encrypted,
            settings: row.settings,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn expect_one(rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

const CALL_FILTER: &str = "tenant_id = $1 \
    AND ($2::uuid IS NULL OR agent_id = $2) \
    AND ($3::text IS NULL OR status = $3) \
    AND ($4::text IS NULL OR direction = $4)";

const CAMPAIGN_FILTER: &str = "tenant_id = $1 \
    AND ($2::uuid IS NULL OR agent_id = $2) \
    AND ($3::text IS NULL OR status = $3)";

#[async_trait]
impl Store for PgStore {
    // =========================================================================
    // Tenants
    // =========================================================================

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenants (id, name, credits_balance, subscription_status, \
             stripe_customer_id, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(*tenant.id.inner())
        .bind(&tenant.name)
        .bind(tenant.credits_balance)
        .bind(tenant.subscription_status.as_str())
        .bind(&tenant.stripe_customer_id)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>> {
        sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE id = $1")
            .bind(*tenant_id.inner())
            .fetch_optional(&self.pool)
            .await?
            .map(Tenant::try_from)
            .transpose()
    }

    async fn find_tenant_by_stripe_customer(&self, customer_id: &str) -> Result<Option<Tenant>> {
        sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE stripe_customer_id = $1")
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Tenant::try_from)
            .transpose()
    }

    async fn update_subscription_status(
        &self,
        tenant_id: TenantId,
        status: SubscriptionStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenants SET subscription_status = $2, updated_at = now() WHERE id = $1",
        )
        .bind(*tenant_id.inner())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    // =========================================================================
    // Credit Ledger
    // =========================================================================

    async fn apply_ledger_entry(&self, entry: &CreditLedgerEntry) -> Result<LedgerOutcome> {
        let mut tx = self.pool.begin().await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT credits_balance FROM tenants WHERE id = $1")
                .bind(*entry.tenant_id.inner())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Err(StoreError::NotFound);
        };

        let inserted = sqlx::query(
            "INSERT INTO credit_ledger (id, tenant_id, type, amount, reference_type, \
             reference_id, description, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (tenant_id, type, reference_type, reference_id) DO NOTHING",
        )
        .bind(entry.id.to_string())
        .bind(*entry.tenant_id.inner())
        .bind(entry.entry_type.as_str())
        .bind(entry.amount)
        .bind(entry.reference_type.as_str())
        .bind(&entry.reference_id)
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.commit().await?;
            return Ok(LedgerOutcome::Duplicate { balance: current });
        }

        let balance: i64 = sqlx::query_scalar(
            "UPDATE tenants SET credits_balance = credits_balance + $2, updated_at = now() \
             WHERE id = $1 RETURNING credits_balance",
        )
        .bind(*entry.tenant_id.inner())
        .bind(entry.delta())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(LedgerOutcome::Applied { balance })
    }

    async fn list_ledger_entries(
        &self,
        tenant_id: TenantId,
        page: Page,
    ) -> Result<Paged<CreditLedgerEntry>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM credit_ledger WHERE tenant_id = $1")
                .bind(*tenant_id.inner())
                .fetch_one(&self.pool)
                .await?;
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT * FROM credit_ledger WHERE tenant_id = $1 ORDER BY id DESC LIMIT $2 OFFSET $3",
        )
        .bind(*tenant_id.inner())
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&self.pool)
        .await?;
        Ok(Paged {
            items: convert_all(rows)?,
            total: to_usize(total),
        })
    }

    // =========================================================================
    // Calls
    // =========================================================================

    async fn insert_call(&self, call: &Call) -> Result<()> {
        sqlx::query(
            "INSERT INTO calls (id, tenant_id, agent_id, ultravox_call_id, phone_number, \
             direction, status, context, call_settings, started_at, ended_at, duration_seconds, \
             cost_usd, recording_url, error_message, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(*call.id.inner())
        .bind(*call.tenant_id.inner())
        .bind(*call.agent_id.inner())
        .bind(&call.ultravox_call_id)
        .bind(&call.phone_number)
        .bind(call.direction.as_str())
        .bind(call.status.as_str())
        .bind(&call.context)
        .bind(&call.call_settings)
        .bind(call.started_at)
        .bind(call.ended_at)
        .bind(call.duration_seconds)
        .bind(call.cost_usd)
        .bind(&call.recording_url)
        .bind(&call.error_message)
        .bind(call.created_at)
        .bind(call.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_call(&self, call: &Call) -> Result<()> {
        let result = sqlx::query(
            "UPDATE calls SET ultravox_call_id = $2, status = $3, started_at = $4, ended_at = $5, \
             duration_seconds = $6, cost_usd = $7, recording_url = $8, error_message = $9, \
             updated_at = $10 WHERE id = $1",
        )
        .bind(*call.id.inner())
        .bind(&call.ultravox_call_id)
        .bind(call.status.as_str())
        .bind(call.started_at)
        .bind(call.ended_at)
        .bind(call.duration_seconds)
        .bind(call.cost_usd)
        .bind(&call.recording_url)
        .bind(&call.error_message)
        .bind(call.updated_at)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    async fn get_call(&self, tenant_id: TenantId, call_id: CallId) -> Result<Option<Call>> {
        sqlx::query_as::<_, CallRow>("SELECT * FROM calls WHERE id = $1 AND tenant_id = $2")
            .bind(*call_id.inner())
            .bind(*tenant_id.inner())
            .fetch_optional(&self.pool)
            .await?
            .map(Call::try_from)
            .transpose()
    }

    async fn find_call_by_ultravox_id(&self, ultravox_call_id: &str) -> Result<Option<Call>> {
        sqlx::query_as::<_, CallRow>("SELECT * FROM calls WHERE ultravox_call_id = $1")
            .bind(ultravox_call_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Call::try_from)
            .transpose()
    }

    async fn list_calls(
        &self,
        tenant_id: TenantId,
        filter: CallFilter,
        page: Page,
    ) -> Result<Paged<Call>> {
        let agent = filter.agent_id.map(|a| *a.inner());
        let status = filter.status.map(|s| s.as_str());
        let direction = filter.direction.map(|d| d.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM calls WHERE {CALL_FILTER}"))
            .bind(*tenant_id.inner())
            .bind(agent)
            .bind(status)
            .bind(direction)
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, CallRow>(&format!(
            "SELECT * FROM calls WHERE {CALL_FILTER} ORDER BY created_at DESC LIMIT $5 OFFSET $6"
        ))
        .bind(*tenant_id.inner())
        .bind(agent)
        .bind(status)
        .bind(direction)
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(Paged {
            items: convert_all(rows)?,
            total: to_usize(total),
        })
    }

    // =========================================================================
    // Agents, voices, knowledge bases, tools
    // =========================================================================

    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents (id, tenant_id, ultravox_agent_id, name, description, voice_id, \
             system_prompt, model, tools, knowledge_bases, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(*agent.id.inner())
        .bind(*agent.tenant_id.inner())
        .bind(&agent.ultravox_agent_id)
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(*agent.voice_id.inner())
        .bind(&agent.system_prompt)
        .bind(&agent.model)
        .bind(serde_json::to_value(&agent.tools)?)
        .bind(serde_json::to_value(&agent.knowledge_bases)?)
        .bind(agent.status.as_str())
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        let result = sqlx::query(
            "UPDATE agents SET ultravox_agent_id = $2, name = $3, description = $4, voice_id = $5, \
             system_prompt = $6, model = $7, tools = $8, knowledge_bases = $9, status = $10, \
             updated_at = $11 WHERE id = $1",
        )
        .bind(*agent.id.inner())
        .bind(&agent.ultravox_agent_id)
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(*agent.voice_id.inner())
        .bind(&agent.system_prompt)
        .bind(&agent.model)
        .bind(serde_json::to_value(&agent.tools)?)
        .bind(serde_json::to_value(&agent.knowledge_bases)?)
        .bind(agent.status.as_str())
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    async fn get_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Option<Agent>> {
        sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = $1 AND tenant_id = $2")
            .bind(*agent_id.inner())
            .bind(*tenant_id.inner())
            .fetch_optional(&self.pool)
            .await?
            .map(Agent::try_from)
            .transpose()
    }

    async fn list_agents(&self, tenant_id: TenantId) -> Result<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT * FROM agents WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(*tenant_id.inner())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn insert_voice(&self, voice: &Voice) -> Result<()> {
        sqlx::query(
            "INSERT INTO voices (id, tenant_id, name, provider, voice_type, language, status, \
             training_info, ultravox_voice_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(*voice.id.inner())
        .bind(*voice.tenant_id.inner())
        .bind(&voice.name)
        .bind(&voice.provider)
        .bind(&voice.voice_type)
        .bind(&voice.language)
        .bind(voice.status.as_str())
        .bind(&voice.training_info)
        .bind(&voice.ultravox_voice_id)
        .bind(voice.created_at)
        .bind(voice.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_voice(&self, voice: &Voice) -> Result<()> {
        let result = sqlx::query(
            "UPDATE voices SET name = $2, status = $3, training_info = $4, \
             ultravox_voice_id = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(*voice.id.inner())
        .bind(&voice.name)
        .bind(voice.status.as_str())
        .bind(&voice.training_info)
        .bind(&voice.ultravox_voice_id)
        .bind(voice.updated_at)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    async fn get_voice(&self, tenant_id: TenantId, voice_id: VoiceId) -> Result<Option<Voice>> {
        sqlx::query_as::<_, VoiceRow>("SELECT * FROM voices WHERE id = $1 AND tenant_id = $2")
            .bind(*voice_id.inner())
            .bind(*tenant_id.inner())
            .fetch_optional(&self.pool)
            .await?
            .map(Voice::try_from)
            .transpose()
    }

    async fn find_voice(&self, voice_id: VoiceId) -> Result<Option<Voice>> {
        sqlx::query_as::<_, VoiceRow>("SELECT * FROM voices WHERE id = $1")
            .bind(*voice_id.inner())
            .fetch_optional(&self.pool)
            .await?
            .map(Voice::try_from)
            .transpose()
    }

    async fn find_voice_by_ultravox_id(&self, ultravox_voice_id: &str) -> Result<Option<Voice>> {
        sqlx::query_as::<_, VoiceRow>("SELECT * FROM voices WHERE ultravox_voice_id = $1")
            .bind(ultravox_voice_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Voice::try_from)
            .transpose()
    }

    async fn list_voices(&self, tenant_id: TenantId) -> Result<Vec<Voice>> {
        let rows = sqlx::query_as::<_, VoiceRow>(
            "SELECT * FROM voices WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(*tenant_id.inner())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn insert_knowledge_base(&self, kb: &KnowledgeBase) -> Result<()> {
        sqlx::query(
            "INSERT INTO knowledge_bases (id, tenant_id, name, description, language, \
             ultravox_corpus_id, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(*kb.id.inner())
        .bind(*kb.tenant_id.inner())
        .bind(&kb.name)
        .bind(&kb.description)
        .bind(&kb.language)
        .bind(&kb.ultravox_corpus_id)
        .bind(kb.status.as_str())
        .bind(kb.created_at)
        .bind(kb.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_knowledge_base(&self, kb: &KnowledgeBase) -> Result<()> {
        let result = sqlx::query(
            "UPDATE knowledge_bases SET name = $2, description = $3, ultravox_corpus_id = $4, \
             status = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(*kb.id.inner())
        .bind(&kb.name)
        .bind(&kb.description)
        .bind(&kb.ultravox_corpus_id)
        .bind(kb.status.as_str())
        .bind(kb.updated_at)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    async fn get_knowledge_base(
        &self,
        tenant_id: TenantId,
        kb_id: KnowledgeBaseId,
    ) -> Result<Option<KnowledgeBase>> {
        sqlx::query_as::<_, KnowledgeBaseRow>(
            "SELECT * FROM knowledge_bases WHERE id = $1 AND tenant_id = $2",
        )
        .bind(*kb_id.inner())
        .bind(*tenant_id.inner())
        .fetch_optional(&self.pool)
        .await?
        .map(KnowledgeBase::try_from)
        .transpose()
    }

    async fn list_knowledge_bases(&self, tenant_id: TenantId) -> Result<Vec<KnowledgeBase>> {
        let rows = sqlx::query_as::<_, KnowledgeBaseRow>(
            "SELECT * FROM knowledge_bases WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(*tenant_id.inner())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn insert_tool(&self, tool: &Tool) -> Result<()> {
        sqlx::query(
            "INSERT INTO tools (id, tenant_id, ultravox_tool_id, name, description, category, \
             endpoint, method, authentication, parameters, response_schema, status, created_at, \
             updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(*tool.id.inner())
        .bind(*tool.tenant_id.inner())
        .bind(&tool.ultravox_tool_id)
        .bind(&tool.name)
        .bind(&tool.description)
        .bind(&tool.category)
        .bind(&tool.endpoint)
        .bind(&tool.method)
        .bind(&tool.authentication)
        .bind(&tool.parameters)
        .bind(&tool.response_schema)
        .bind(tool.status.as_str())
        .bind(tool.created_at)
        .bind(tool.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_tool(&self, tool: &Tool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tools SET ultravox_tool_id = $2, name = $3, description = $4, category = $5, \
             endpoint = $6, method = $7, authentication = $8, parameters = $9, \
             response_schema = $10, status = $11, updated_at = $12 WHERE id = $1",
        )
        .bind(*tool.id.inner())
        .bind(&tool.ultravox_tool_id)
        .bind(&tool.name)
        .bind(&tool.description)
        .bind(&tool.category)
        .bind(&tool.endpoint)
        .bind(&tool.method)
        .bind(&tool.authentication)
        .bind(&tool.parameters)
        .bind(&tool.response_schema)
        .bind(tool.status.as_str())
        .bind(tool.updated_at)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    async fn get_tool(&self, tenant_id: TenantId, tool_id: ToolId) -> Result<Option<Tool>> {
        sqlx::query_as::<_, ToolRow>("SELECT * FROM tools WHERE id = $1 AND tenant_id = $2")
            .bind(*tool_id.inner())
            .bind(*tenant_id.inner())
            .fetch_optional(&self.pool)
            .await?
            .map(Tool::try_from)
            .transpose()
    }

    async fn list_tools(&self, tenant_id: TenantId) -> Result<Vec<Tool>> {
        let rows =
            sqlx::query_as::<_, ToolRow>("SELECT * FROM tools WHERE tenant_id = $1 ORDER BY created_at")
                .bind(*tenant_id.inner())
                .fetch_all(&self.pool)
                .await?;
        convert_all(rows)
    }

    async fn delete_tool(&self, tenant_id: TenantId, tool_id: ToolId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tools WHERE id = $1 AND tenant_id = $2")
            .bind(*tool_id.inner())
            .bind(*tenant_id.inner())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Campaigns
    // =========================================================================

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaigns (id, tenant_id, agent_id, name, schedule_type, scheduled_at, \
             timezone, max_concurrent_calls, status, ultravox_batch_ids, stats, created_at, \
             updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(*campaign.id.inner())
        .bind(*campaign.tenant_id.inner())
        .bind(*campaign.agent_id.inner())
        .bind(&campaign.name)
        .bind(campaign.schedule_type.as_str())
        .bind(campaign.scheduled_at)
        .bind(&campaign.timezone)
        .bind(to_i32(campaign.max_concurrent_calls))
        .bind(campaign.status.as_str())
        .bind(serde_json::to_value(&campaign.ultravox_batch_ids)?)
        .bind(serde_json::to_value(campaign.stats)?)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_campaign(&self, campaign: &Campaign) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaigns SET agent_id = $2, name = $3, schedule_type = $4, \
             scheduled_at = $5, timezone = $6, max_concurrent_calls = $7, status = $8, \
             ultravox_batch_ids = $9, updated_at = $10 WHERE id = $1",
        )
        .bind(*campaign.id.inner())
        .bind(*campaign.agent_id.inner())
        .bind(&campaign.name)
        .bind(campaign.schedule_type.as_str())
        .bind(campaign.scheduled_at)
        .bind(&campaign.timezone)
        .bind(to_i32(campaign.max_concurrent_calls))
        .bind(campaign.status.as_str())
        .bind(serde_json::to_value(&campaign.ultravox_batch_ids)?)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    async fn get_campaign(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
    ) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, CampaignRow>(
            "SELECT * FROM campaigns WHERE id = $1 AND tenant_id = $2",
        )
        .bind(*campaign_id.inner())
        .bind(*tenant_id.inner())
        .fetch_optional(&self.pool)
        .await?
        .map(Campaign::try_from)
        .transpose()
    }

    async fn find_campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, CampaignRow>("SELECT * FROM campaigns WHERE id = $1")
            .bind(*campaign_id.inner())
            .fetch_optional(&self.pool)
            .await?
            .map(Campaign::try_from)
            .transpose()
    }

    async fn list_campaigns(
        &self,
        tenant_id: TenantId,
        filter: CampaignFilter,
        page: Page,
    ) -> Result<Paged<Campaign>> {
        let agent = filter.agent_id.map(|a| *a.inner());
        let status = filter.status.map(|s| s.as_str());

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM campaigns WHERE {CAMPAIGN_FILTER}"))
                .bind(*tenant_id.inner())
                .bind(agent)
                .bind(status)
                .fetch_one(&self.pool)
                .await?;
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT * FROM campaigns WHERE {CAMPAIGN_FILTER} ORDER BY created_at LIMIT $4 OFFSET $5"
        ))
        .bind(*tenant_id.inner())
        .bind(agent)
        .bind(status)
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(Paged {
            items: convert_all(rows)?,
            total: to_usize(total),
        })
    }

    async fn delete_campaign(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = $1 AND tenant_id = $2")
            .bind(*campaign_id.inner())
            .bind(*tenant_id.inner())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_contacts(&self, contacts: &[CampaignContact]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0u64;
        for contact in contacts {
            added += sqlx::query(
                "INSERT INTO campaign_contacts (id, campaign_id, phone_number, first_name, \
                 last_name, email, custom_fields, status, call_id, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (campaign_id, phone_number) DO NOTHING",
            )
            .bind(*contact.id.inner())
            .bind(*contact.campaign_id.inner())
            .bind(&contact.phone_number)
            .bind(&contact.first_name)
            .bind(&contact.last_name)
            .bind(&contact.email)
            .bind(&contact.custom_fields)
            .bind(contact.status.as_str())
            .bind(contact.call_id.map(|c| *c.inner()))
            .bind(contact.created_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(usize::try_from(added).unwrap_or(usize::MAX))
    }

    async fn list_contacts(&self, campaign_id: CampaignId) -> Result<Vec<CampaignContact>> {
        let rows = sqlx::query_as::<_, ContactRow>(
            "SELECT * FROM campaign_contacts WHERE campaign_id = $1 ORDER BY created_at",
        )
        .bind(*campaign_id.inner())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn set_contact_status(
        &self,
        campaign_id: CampaignId,
        phone_number: &str,
        status: ContactStatus,
        call_id: Option<CallId>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaign_contacts SET status = $3, call_id = COALESCE($4, call_id) \
             WHERE campaign_id = $1 AND phone_number = $2",
        )
        .bind(*campaign_id.inner())
        .bind(phone_number)
        .bind(status.as_str())
        .bind(call_id.map(|c| *c.inner()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recompute_campaign_stats(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignStats>> {
        let stats: Option<Value> = sqlx::query_scalar(
            "UPDATE campaigns SET updated_at = now(), stats = jsonb_build_object( \
                 'pending', s.pending, 'calling', s.calling, \
                 'completed', s.completed, 'failed', s.failed) \
             FROM (SELECT \
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                 COUNT(*) FILTER (WHERE status = 'calling') AS calling, \
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed \
                 FROM campaign_contacts WHERE campaign_id = $1) AS s \
             WHERE campaigns.id = $1 RETURNING campaigns.stats",
        )
        .bind(*campaign_id.inner())
        .fetch_optional(&self.pool)
        .await?;
        stats
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .transpose()
    }

    // =========================================================================
    // Idempotency
    // =========================================================================

    async fn get_idempotency_record(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(
            "SELECT * FROM idempotency_keys WHERE tenant_id = $1 AND key = $2",
        )
        .bind(*tenant_id.inner())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(IdempotencyRecord::from))
    }

    async fn insert_idempotency_record(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<IdempotencyInsert> {
        let written = sqlx::query(
            "INSERT INTO idempotency_keys (tenant_id, key, request_fingerprint, status_code, \
             response_body, created_at, expires_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (tenant_id, key) DO UPDATE SET \
                 request_fingerprint = EXCLUDED.request_fingerprint, \
                 status_code = EXCLUDED.status_code, \
                 response_body = EXCLUDED.response_body, \
                 created_at = EXCLUDED.created_at, \
                 expires_at = EXCLUDED.expires_at \
             WHERE idempotency_keys.expires_at <= EXCLUDED.created_at",
        )
        .bind(*record.tenant_id.inner())
        .bind(&record.key)
        .bind(&record.request_fingerprint)
        .bind(i32::from(record.response.status_code))
        .bind(&record.response.body)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if written > 0 {
            return Ok(IdempotencyInsert::Inserted);
        }

        match self.get_idempotency_record(record.tenant_id, &record.key).await? {
            Some(existing) => Ok(IdempotencyInsert::Exists(existing)),
            None => Err(StoreError::Conflict(format!(
                "idempotency key {} changed concurrently",
                record.key
            ))),
        }
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Webhook endpoints and deliveries
    // =========================================================================

    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_endpoints (id, tenant_id, url, event_types, secret, enabled, \
             max_attempts, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(*endpoint.id.inner())
        .bind(*endpoint.tenant_id.inner())
        .bind(&endpoint.url)
        .bind(serde_json::to_value(&endpoint.event_types)?)
        .bind(&endpoint.secret)
        .bind(endpoint.enabled)
        .bind(to_i32(endpoint.max_attempts))
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        let result = sqlx::query(
            "UPDATE webhook_endpoints SET url = $2, event_types = $3, enabled = $4, \
             max_attempts = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(*endpoint.id.inner())
        .bind(&endpoint.url)
        .bind(serde_json::to_value(&endpoint.event_types)?)
        .bind(endpoint.enabled)
        .bind(to_i32(endpoint.max_attempts))
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    async fn get_endpoint(
        &self,
        tenant_id: TenantId,
        endpoint_id: WebhookEndpointId,
    ) -> Result<Option<WebhookEndpoint>> {
        sqlx::query_as::<_, EndpointRow>(
            "SELECT * FROM webhook_endpoints WHERE id = $1 AND tenant_id = $2",
        )
        .bind(*endpoint_id.inner())
        .bind(*tenant_id.inner())
        .fetch_optional(&self.pool)
        .await?
        .map(WebhookEndpoint::try_from)
        .transpose()
    }

    async fn find_endpoint(
        &self,
        endpoint_id: WebhookEndpointId,
    ) -> Result<Option<WebhookEndpoint>> {
        sqlx::query_as::<_, EndpointRow>("SELECT * FROM webhook_endpoints WHERE id = $1")
            .bind(*endpoint_id.inner())
            .fetch_optional(&self.pool)
            .await?
            .map(WebhookEndpoint::try_from)
            .transpose()
    }

    async fn list_endpoints(&self, tenant_id: TenantId) -> Result<Vec<WebhookEndpoint>> {
        let rows = sqlx::query_as::<_, EndpointRow>(
            "SELECT * FROM webhook_endpoints WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(*tenant_id.inner())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_subscribed_endpoints(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>> {
        let rows = sqlx::query_as::<_, EndpointRow>(
            "SELECT * FROM webhook_endpoints WHERE tenant_id = $1 AND enabled \
             AND (event_types ? $2 OR event_types ? '*') ORDER BY created_at",
        )
        .bind(*tenant_id.inner())
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn delete_endpoint(
        &self,
        tenant_id: TenantId,
        endpoint_id: WebhookEndpointId,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhook_endpoints WHERE id = $1 AND tenant_id = $2")
            .bind(*endpoint_id.inner())
            .bind(*tenant_id.inner())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_deliveries (id, endpoint_id, tenant_id, event_type, payload, \
             status, attempt, response_code, error_message, next_attempt_at, delivered_at, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(*delivery.id.inner())
        .bind(*delivery.endpoint_id.inner())
        .bind(*delivery.tenant_id.inner())
        .bind(&delivery.event_type)
        .bind(serde_json::to_value(&delivery.payload)?)
        .bind(delivery.status.as_str())
        .bind(to_i32(delivery.attempt))
        .bind(delivery.response_code.map(i32::from))
        .bind(&delivery.error_message)
        .bind(delivery.next_attempt_at)
        .bind(delivery.delivered_at)
        .bind(delivery.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let result = sqlx::query(
            "UPDATE webhook_deliveries SET status = $2, attempt = $3, response_code = $4, \
             error_message = $5, next_attempt_at = $6, delivered_at = $7 WHERE id = $1",
        )
        .bind(*delivery.id.inner())
        .bind(delivery.status.as_str())
        .bind(to_i32(delivery.attempt))
        .bind(delivery.response_code.map(i32::from))
        .bind(&delivery.error_message)
        .bind(delivery.next_attempt_at)
        .bind(delivery.delivered_at)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    async fn get_delivery(&self, delivery_id: DeliveryId) -> Result<Option<WebhookDelivery>> {
        sqlx::query_as::<_, DeliveryRow>("SELECT * FROM webhook_deliveries WHERE id = $1")
            .bind(*delivery_id.inner())
            .fetch_optional(&self.pool)
            .await?
            .map(WebhookDelivery::try_from)
            .transpose()
    }

    async fn list_retryable_deliveries(
        &self,
        stranded_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            "SELECT * FROM webhook_deliveries WHERE status = 'failed' \
             OR (status = 'pending' AND COALESCE(next_attempt_at, created_at) <= $1) \
             ORDER BY created_at LIMIT $2",
        )
        .bind(stranded_before)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    // =========================================================================
    // Audit log
    // =========================================================================

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (id, tenant_id, user_id, action, table_name, record_id, \
             diff, metadata, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id.to_string())
        .bind(*entry.tenant_id.inner())
        .bind(&entry.user_id)
        .bind(entry.action.as_str())
        .bind(&entry.table_name)
        .bind(&entry.record_id)
        .bind(&entry.diff)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit_entries(
        &self,
        tenant_id: TenantId,
        page: Page,
    ) -> Result<Paged<AuditEntry>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs WHERE tenant_id = $1")
            .bind(*tenant_id.inner())
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT * FROM audit_logs WHERE tenant_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
        )
        .bind(*tenant_id.inner())
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&self.pool)
        .await?;
        Ok(Paged {
            items: convert_all(rows)?,
            total: to_usize(total),
        })
    }

    // =========================================================================
    // API keys
    // =========================================================================

    async fn insert_api_key(&self, key: &ApiKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_keys (id, tenant_id, service, key_name, encrypted_key, encrypted, \
             settings, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(*key.id.inner())
        .bind(*key.tenant_id.inner())
        .bind(&key.service)
        .bind(&key.key_name)
        .bind(&key.encrypted_key)
        .bind(key.encrypted)
        .bind(&key.settings)
        .bind(key.is_active)
        .bind(key.created_at)
        .bind(key.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_api_key(&self, key: &ApiKey) -> Result<()> {
        let result = sqlx::query(
            "UPDATE api_keys SET encrypted_key = $2, encrypted = $3, settings = $4, \
             is_active = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(*key.id.inner())
        .bind(&key.encrypted_key)
        .bind(key.encrypted)
        .bind(&key.settings)
        .bind(key.is_active)
        .bind(key.updated_at)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    async fn get_api_key_for_service(
        &self,
        tenant_id: TenantId,
        service: &str,
    ) -> Result<Option<ApiKey>> {
        Ok(sqlx::query_as::<_, ApiKeyRow>(
            "SELECT * FROM api_keys WHERE tenant_id = $1 AND service = $2 \
             ORDER BY created_at LIMIT 1",
        )
        .bind(*tenant_id.inner())
        .bind(service)
        .fetch_optional(&self.pool)
        .await?
        .map(ApiKey::from))
    }

    async fn list_api_keys(&self, tenant_id: TenantId) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT * FROM api_keys WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(*tenant_id.inner())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApiKey::from).collect())
    }
}
