//! Audit log handler.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;

use trudy_core::AuditEntry;

use super::{paged, ListEnvelope, PageQuery};
use crate::auth::{Manage, Require};
use crate::error::ApiError;
use crate::state::AppState;

/// List the tenant's audit entries, newest first.
pub async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    auth: Require<Manage>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListEnvelope<AuditEntry>>, ApiError> {
    let page = query.page();
    let entries = state.store.list_audit_entries(auth.tenant_id, page).await?;
    Ok(paged(entries, page))
}
