//! In-memory storage implementation.
//!
//! All state lives behind one mutex, so every trait method is atomic with
//! respect to every other. The lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use trudy_core::{
    Agent, AgentId, ApiKey, ApiKeyId, AuditEntry, Call, CallId, Campaign, CampaignContact,
    CampaignId, CampaignStats, ContactStatus, CreditLedgerEntry, DeliveryId, DeliveryStatus,
    IdempotencyRecord, KnowledgeBase, KnowledgeBaseId, LedgerEntryType, ReferenceType,
    SubscriptionStatus, Tenant, TenantId, Tool, ToolId, Voice, VoiceId, WebhookDelivery,
    WebhookEndpoint, WebhookEndpointId,
};

use crate::error::{Result, StoreError};
use crate::{
    CallFilter, CampaignFilter, IdempotencyInsert, LedgerOutcome, Page, Paged, Store,
};

type LedgerKey = (TenantId, LedgerEntryType, ReferenceType, String);

#[derive(Default)]
struct Inner {
    tenants: HashMap<TenantId, Tenant>,
    ledger: Vec<CreditLedgerEntry>,
    ledger_keys: HashMap<LedgerKey, usize>,
    calls: HashMap<CallId, Call>,
    agents: HashMap<AgentId, Agent>,
    voices: HashMap<VoiceId, Voice>,
    knowledge_bases: HashMap<KnowledgeBaseId, KnowledgeBase>,
    tools: HashMap<ToolId, Tool>,
    campaigns: HashMap<CampaignId, Campaign>,
    contacts: Vec<CampaignContact>,
    idempotency: HashMap<(TenantId, String), IdempotencyRecord>,
    endpoints: HashMap<WebhookEndpointId, WebhookEndpoint>,
    deliveries: HashMap<DeliveryId, WebhookDelivery>,
    audit: Vec<AuditEntry>,
    api_keys: HashMap<ApiKeyId, ApiKey>,
}

/// Process-local storage for tests and development.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".to_string()))
    }
}

fn paginate<T: Clone>(mut items: Vec<T>, page: Page) -> Paged<T> {
    let total = items.len();
    let items = if page.offset >= total {
        Vec::new()
    } else {
        items.drain(page.offset..).take(page.limit).collect()
    };
    Paged { items, total }
}

fn replace<K, V>(map: &mut HashMap<K, V>, key: K, value: V) -> Result<()>
where
    K: std::hash::Hash + Eq,
{
    match map.get_mut(&key) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(StoreError::NotFound),
    }
}

fn owned_by<'a, K, V>(
    map: &'a HashMap<K, V>,
    key: &K,
    tenant_id: TenantId,
    owner: impl Fn(&V) -> TenantId,
) -> Option<&'a V>
where
    K: std::hash::Hash + Eq,
{
    map.get(key).filter(|v| owner(v) == tenant_id)
}

fn sorted_by_created<T: Clone>(
    values: impl Iterator<Item = T>,
    created_at: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<T> {
    let mut out: Vec<T> = values.collect();
    out.sort_by_key(|v| created_at(v));
    out
}

#[async_trait]
impl Store for MemoryStore {
    // =========================================================================
    // Tenants
    // =========================================================================

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.tenants.contains_key(&tenant.id) {
            return Err(StoreError::Conflict(format!("tenant {} exists", tenant.id)));
        }
        inner.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>> {
        Ok(self.lock()?.tenants.get(&tenant_id).cloned())
    }

    async fn find_tenant_by_stripe_customer(&self, customer_id: &str) -> Result<Option<Tenant>> {
        Ok(self
            .lock()?
            .tenants
            .values()
            .find(|t| t.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn update_subscription_status(
        &self,
        tenant_id: TenantId,
        status: SubscriptionStatus,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let tenant = inner.tenants.get_mut(&tenant_id).ok_or(StoreError::NotFound)?;
        tenant.subscription_status = status;
        tenant.updated_at = Utc::now();
        Ok(())
    }

    // =========================================================================
    // Credit Ledger
    // =========================================================================

    async fn apply_ledger_entry(&self, entry: &CreditLedgerEntry) -> Result<LedgerOutcome> {
        let mut inner = self.lock()?;
        let balance = inner
            .tenants
            .get(&entry.tenant_id)
            .map(|t| t.credits_balance)
            .ok_or(StoreError::NotFound)?;

        let key = (
            entry.tenant_id,
            entry.entry_type,
            entry.reference_type,
            entry.reference_id.clone(),
        );
        if inner.ledger_keys.contains_key(&key) {
            return Ok(LedgerOutcome::Duplicate { balance });
        }

        let index = inner.ledger.len();
        inner.ledger.push(entry.clone());
        inner.ledger_keys.insert(key, index);

        let tenant = inner
            .tenants
            .get_mut(&entry.tenant_id)
            .ok_or(StoreError::NotFound)?;
        tenant.credits_balance += entry.delta();
        tenant.updated_at = Utc::now();
        Ok(LedgerOutcome::Applied {
            balance: tenant.credits_balance,
        })
    }

    async fn list_ledger_entries(
        &self,
        tenant_id: TenantId,
        page: Page,
    ) -> Result<Paged<CreditLedgerEntry>> {
        let inner = self.lock()?;
        let mut entries: Vec<CreditLedgerEntry> = inner
            .ledger
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(paginate(entries, page))
    }

    // =========================================================================
    // Calls
    // =========================================================================

    async fn insert_call(&self, call: &Call) -> Result<()> {
        self.lock()?.calls.insert(call.id, call.clone());
        Ok(())
    }

    async fn update_call(&self, call: &Call) -> Result<()> {
        replace(&mut self.lock()?.calls, call.id, call.clone())
    }

    async fn get_call(&self, tenant_id: TenantId, call_id: CallId) -> Result<Option<Call>> {
        let inner = self.lock()?;
        Ok(owned_by(&inner.calls, &call_id, tenant_id, |c| c.tenant_id).cloned())
    }

    async fn find_call_by_ultravox_id(&self, ultravox_call_id: &str) -> Result<Option<Call>> {
        Ok(self
            .lock()?
            .calls
            .values()
            .find(|c| c.ultravox_call_id.as_deref() == Some(ultravox_call_id))
            .cloned())
    }

    async fn list_calls(
        &self,
        tenant_id: TenantId,
        filter: CallFilter,
        page: Page,
    ) -> Result<Paged<Call>> {
        let inner = self.lock()?;
        let mut calls = sorted_by_created(
            inner
                .calls
                .values()
                .filter(|c| c.tenant_id == tenant_id)
                .filter(|c| filter.agent_id.map_or(true, |a| c.agent_id == a))
                .filter(|c| filter.status.map_or(true, |s| c.status == s))
                .filter(|c| filter.direction.map_or(true, |d| c.direction == d))
                .cloned(),
            |c| c.created_at,
        );
        calls.reverse();
        Ok(paginate(calls, page))
    }

    // =========================================================================
    // Agents, voices, knowledge bases, tools
    // =========================================================================

    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        self.lock()?.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        replace(&mut self.lock()?.agents, agent.id, agent.clone())
    }

    async fn get_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Option<Agent>> {
        let inner = self.lock()?;
        Ok(owned_by(&inner.agents, &agent_id, tenant_id, |a| a.tenant_id).cloned())
    }

    async fn list_agents(&self, tenant_id: TenantId) -> Result<Vec<Agent>> {
        let inner = self.lock()?;
        Ok(sorted_by_created(
            inner.agents.values().filter(|a| a.tenant_id == tenant_id).cloned(),
            |a| a.created_at,
        ))
    }

    async fn insert_voice(&self, voice: &Voice) -> Result<()> {
        self.lock()?.voices.insert(voice.id, voice.clone());
        Ok(())
    }

    async fn update_voice(&self, voice: &Voice) -> Result<()> {
        replace(&mut self.lock()?.voices, voice.id, voice.clone())
    }

    async fn get_voice(&self, tenant_id: TenantId, voice_id: VoiceId) -> Result<Option<Voice>> {
        let inner = self.lock()?;
        Ok(owned_by(&inner.voices, &voice_id, tenant_id, |v| v.tenant_id).cloned())
    }

    async fn find_voice(&self, voice_id: VoiceId) -> Result<Option<Voice>> {
        Ok(self.lock()?.voices.get(&voice_id).cloned())
    }

    async fn find_voice_by_ultravox_id(&self, ultravox_voice_id: &str) -> Result<Option<Voice>> {
        Ok(self
            .lock()?
            .voices
            .values()
            .find(|v| v.ultravox_voice_id.as_deref() == Some(ultravox_voice_id))
            .cloned())
    }

    async fn list_voices(&self, tenant_id: TenantId) -> Result<Vec<Voice>> {
        let inner = self.lock()?;
        Ok(sorted_by_created(
            inner.voices.values().filter(|v| v.tenant_id == tenant_id).cloned(),
            |v| v.created_at,
        ))
    }

    async fn insert_knowledge_base(&self, kb: &KnowledgeBase) -> Result<()> {
        self.lock()?.knowledge_bases.insert(kb.id, kb.clone());
        Ok(())
    }

    async fn update_knowledge_base(&self, kb: &KnowledgeBase) -> Result<()> {
        replace(&mut self.lock()?.knowledge_bases, kb.id, kb.clone())
    }

    async fn get_knowledge_base(
        &self,
        tenant_id: TenantId,
        kb_id: KnowledgeBaseId,
    ) -> Result<Option<KnowledgeBase>> {
        let inner = self.lock()?;
        Ok(owned_by(&inner.knowledge_bases, &kb_id, tenant_id, |k| k.tenant_id).cloned())
    }

    async fn list_knowledge_bases(&self, tenant_id: TenantId) -> Result<Vec<KnowledgeBase>> {
        let inner = self.lock()?;
        Ok(sorted_by_created(
            inner
                .knowledge_bases
                .values()
                .filter(|k| k.tenant_id == tenant_id)
                .cloned(),
            |k| k.created_at,
        ))
    }

    async fn insert_tool(&self, tool: &Tool) -> Result<()> {
        self.lock()?.tools.insert(tool.id, tool.clone());
        Ok(())
    }

    async fn update_tool(&self, tool: &Tool) -> Result<()> {
        replace(&mut self.lock()?.tools, tool.id, tool.clone())
    }

    async fn get_tool(&self, tenant_id: TenantId, tool_id: ToolId) -> Result<Option<Tool>> {
        let inner = self.lock()?;
        Ok(owned_by(&inner.tools, &tool_id, tenant_id, |t| t.tenant_id).cloned())
    }

    async fn list_tools(&self, tenant_id: TenantId) -> Result<Vec<Tool>> {
        let inner = self.lock()?;
        Ok(sorted_by_created(
            inner.tools.values().filter(|t| t.tenant_id == tenant_id).cloned(),
            |t| t.created_at,
        ))
    }

    async fn delete_tool(&self, tenant_id: TenantId, tool_id: ToolId) -> Result<bool> {
        let mut inner = self.lock()?;
        if owned_by(&inner.tools, &tool_id, tenant_id, |t| t.tenant_id).is_none() {
            return Ok(false);
        }
        Ok(inner.tools.remove(&tool_id).is_some())
    }

    // =========================================================================
    // Campaigns
    // =========================================================================

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.lock()?.campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn update_campaign(&self, campaign: &Campaign) -> Result<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .campaigns
            .get_mut(&campaign.id)
            .ok_or(StoreError::NotFound)?;
        let stats = stored.stats;
        *stored = campaign.clone();
        stored.stats = stats;
        Ok(())
    }

    async fn get_campaign(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
    ) -> Result<Option<Campaign>> {
        let inner = self.lock()?;
        Ok(owned_by(&inner.campaigns, &campaign_id, tenant_id, |c| c.tenant_id).cloned())
    }

    async fn find_campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.lock()?.campaigns.get(&campaign_id).cloned())
    }

    async fn list_campaigns(
        &self,
        tenant_id: TenantId,
        filter: CampaignFilter,
        page: Page,
    ) -> Result<Paged<Campaign>> {
        let inner = self.lock()?;
        let campaigns = sorted_by_created(
            inner
                .campaigns
                .values()
                .filter(|c| c.tenant_id == tenant_id)
                .filter(|c| filter.agent_id.map_or(true, |a| c.agent_id == a))
                .filter(|c| filter.status.map_or(true, |s| c.status == s))
                .cloned(),
            |c| c.created_at,
        );
        Ok(paginate(campaigns, page))
    }

    async fn delete_campaign(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<bool> {
        let mut inner = self.lock()?;
        if owned_by(&inner.campaigns, &campaign_id, tenant_id, |c| c.tenant_id).is_none() {
            return Ok(false);
        }
        inner.campaigns.remove(&campaign_id);
        inner.contacts.retain(|c| c.campaign_id != campaign_id);
        Ok(true)
    }

    async fn insert_contacts(&self, contacts: &[CampaignContact]) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut added = 0;
        for contact in contacts {
            let duplicate = inner.contacts.iter().any(|c| {
                c.campaign_id == contact.campaign_id && c.phone_number == contact.phone_number
            });
            if duplicate {
                continue;
            }
            inner.contacts.push(contact.clone());
            added += 1;
        }
        Ok(added)
    }

    async fn list_contacts(&self, campaign_id: CampaignId) -> Result<Vec<CampaignContact>> {
        Ok(self
            .lock()?
            .contacts
            .iter()
            .filter(|c| c.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn set_contact_status(
        &self,
        campaign_id: CampaignId,
        phone_number: &str,
        status: ContactStatus,
        call_id: Option<CallId>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(contact) = inner
            .contacts
            .iter_mut()
            .find(|c| c.campaign_id == campaign_id && c.phone_number == phone_number)
        else {
            return Ok(false);
        };
        contact.status = status;
        if call_id.is_some() {
            contact.call_id = call_id;
        }
        Ok(true)
    }

    async fn recompute_campaign_stats(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignStats>> {
        let mut inner = self.lock()?;
        let stats = CampaignStats::from_contacts(
            inner.contacts.iter().filter(|c| c.campaign_id == campaign_id),
        );
        let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
            return Ok(None);
        };
        campaign.stats = stats;
        campaign.updated_at = Utc::now();
        Ok(Some(stats))
    }

    // =========================================================================
    // Idempotency
    // =========================================================================

    async fn get_idempotency_record(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .lock()?
            .idempotency
            .get(&(tenant_id, key.to_string()))
            .cloned())
    }

    async fn insert_idempotency_record(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<IdempotencyInsert> {
        let mut inner = self.lock()?;
        let key = (record.tenant_id, record.key.clone());
        if let Some(existing) = inner.idempotency.get(&key) {
            if !existing.is_expired(record.created_at) {
                return Ok(IdempotencyInsert::Exists(existing.clone()));
            }
        }
        inner.idempotency.insert(key, record.clone());
        Ok(IdempotencyInsert::Inserted)
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, r| !r.is_expired(now));
        Ok((before - inner.idempotency.len()) as u64)
    }

    // =========================================================================
    // Webhook endpoints and deliveries
    // =========================================================================

    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        self.lock()?.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        replace(&mut self.lock()?.endpoints, endpoint.id, endpoint.clone())
    }

    async fn get_endpoint(
        &self,
        tenant_id: TenantId,
        endpoint_id: WebhookEndpointId,
    ) -> Result<Option<WebhookEndpoint>> {
        let inner = self.lock()?;
        Ok(owned_by(&inner.endpoints, &endpoint_id, tenant_id, |e| e.tenant_id).cloned())
    }

    async fn find_endpoint(
        &self,
        endpoint_id: WebhookEndpointId,
    ) -> Result<Option<WebhookEndpoint>> {
        Ok(self.lock()?.endpoints.get(&endpoint_id).cloned())
    }

    async fn list_endpoints(&self, tenant_id: TenantId) -> Result<Vec<WebhookEndpoint>> {
        let inner = self.lock()?;
        Ok(sorted_by_created(
            inner
                .endpoints
                .values()
                .filter(|e| e.tenant_id == tenant_id)
                .cloned(),
            |e| e.created_at,
        ))
    }

    async fn list_subscribed_endpoints(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>> {
        let inner = self.lock()?;
        Ok(sorted_by_created(
            inner
                .endpoints
                .values()
                .filter(|e| e.tenant_id == tenant_id && e.subscribes_to(event_type))
                .cloned(),
            |e| e.created_at,
        ))
    }

    async fn delete_endpoint(
        &self,
        tenant_id: TenantId,
        endpoint_id: WebhookEndpointId,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        if owned_by(&inner.endpoints, &endpoint_id, tenant_id, |e| e.tenant_id).is_none() {
            return Ok(false);
        }
        Ok(inner.endpoints.remove(&endpoint_id).is_some())
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        self.lock()?.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        replace(&mut self.lock()?.deliveries, delivery.id, delivery.clone())
    }

    async fn get_delivery(&self, delivery_id: DeliveryId) -> Result<Option<WebhookDelivery>> {
        Ok(self.lock()?.deliveries.get(&delivery_id).cloned())
    }

    async fn list_retryable_deliveries(
        &self,
        stranded_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>> {
        let inner = self.lock()?;
        let mut retryable = sorted_by_created(
            inner
                .deliveries
                .values()
                .filter(|d| match d.status {
                    DeliveryStatus::Failed => true,
                    DeliveryStatus::Pending => {
                        d.next_attempt_at.unwrap_or(d.created_at) <= stranded_before
                    }
                    DeliveryStatus::Delivered => false,
                })
                .cloned(),
            |d| d.created_at,
        );
        retryable.truncate(limit);
        Ok(retryable)
    }

    // =========================================================================
    // Audit log
    // =========================================================================

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        self.lock()?.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit_entries(
        &self,
        tenant_id: TenantId,
        page: Page,
    ) -> Result<Paged<AuditEntry>> {
        let inner = self.lock()?;
        let mut entries: Vec<AuditEntry> = inner
            .audit
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(paginate(entries, page))
    }

    // =========================================================================
    // API keys
    // =========================================================================

    async fn insert_api_key(&self, key: &ApiKey) -> Result<()> {
        let mut inner = self.lock()?;
        let duplicate = inner.api_keys.values().any(|k| {
            k.tenant_id == key.tenant_id && k.service == key.service && k.key_name == key.key_name
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "API key {} already exists for {}",
                key.key_name, key.service
            )));
        }
        inner.api_keys.insert(key.id, key.clone());
        Ok(())
    }

    async fn update_api_key(&self, key: &ApiKey) -> Result<()> {
        replace(&mut self.lock()?.api_keys, key.id, key.clone())
    }

    async fn get_api_key_for_service(
        &self,
        tenant_id: TenantId,
        service: &str,
    ) -> Result<Option<ApiKey>> {
        let inner = self.lock()?;
        Ok(inner
            .api_keys
            .values()
            .filter(|k| k.tenant_id == tenant_id && k.service == service)
            .min_by_key(|k| k.created_at)
            .cloned())
    }

    async fn list_api_keys(&self, tenant_id: TenantId) -> Result<Vec<ApiKey>> {
        let inner = self.lock()?;
        Ok(sorted_by_created(
            inner
                .api_keys
                .values()
                .filter(|k| k.tenant_id == tenant_id)
                .cloned(),
            |k| k.created_at,
        ))
    }
}
