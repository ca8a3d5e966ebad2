//! Credit balance and ledger handlers.
//!
//! Read-only: credits change through payment webhooks, call billing and
//! voice training, never through this API.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Serialize;

use trudy_core::{CreditLedgerEntry, SubscriptionStatus, TenantId};

use super::{ok, paged, Envelope, ListEnvelope, PageQuery};
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Tenant the balance belongs to.
    pub client_id: TenantId,
    /// Current balance in credits (1 credit = 1 call minute).
    pub credits_balance: i64,
    /// Subscription status.
    pub subscription_status: SubscriptionStatus,
}

/// Get the current credit balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<Envelope<BalanceResponse>>, ApiError> {
    let tenant = state
        .store
        .get_tenant(auth.tenant_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Client"))?;

    Ok(ok(BalanceResponse {
        client_id: tenant.id,
        credits_balance: tenant.credits_balance,
        subscription_status: tenant.subscription_status,
    }))
}

/// List ledger entries, newest first.
pub async fn list_ledger(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListEnvelope<CreditLedgerEntry>>, ApiError> {
    let page = query.page();
    let entries = state.store.list_ledger_entries(auth.tenant_id, page).await?;
    Ok(paged(entries, page))
}
