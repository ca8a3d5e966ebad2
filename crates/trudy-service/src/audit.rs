//! Audit trail of tenant mutations.
//!
//! Handlers record an entry after a mutation commits. Writing the entry
//! never fails the request: store errors are logged and dropped.

use serde::Serialize;

use trudy_core::{field_diff, AuditAction, AuditEntry};

use crate::auth::AuthUser;
use crate::state::AppState;

/// An entry attributed to `user`.
#[must_use]
pub fn entry(
    user: &AuthUser,
    action: AuditAction,
    table_name: &str,
    record_id: impl ToString,
) -> AuditEntry {
    AuditEntry::new(user.tenant_id, action, table_name, record_id.to_string()).by(&user.subject)
}

/// Fields whose values never reach the audit log.
const REDACTED_FIELDS: &[&str] = &["authentication", "secret", "encrypted_key"];

/// Diff between two serializable snapshots of a record.
///
/// `updated_at` is dropped; it changes on every write. Credential fields are
/// reported as changed without their values.
#[must_use]
pub fn diff<T: Serialize>(before: &T, after: &T) -> serde_json::Value {
    let (Ok(before), Ok(after)) = (serde_json::to_value(before), serde_json::to_value(after))
    else {
        return serde_json::json!({});
    };
    let mut changed = field_diff(&before, &after);
    if let Some(fields) = changed.as_object_mut() {
        fields.remove("updated_at");
        for field in REDACTED_FIELDS {
            if let Some(value) = fields.get_mut(*field) {
                *value = serde_json::json!({ "before": "[redacted]", "after": "[redacted]" });
            }
        }
    }
    changed
}

/// Store `entry`, logging instead of failing.
pub async fn record(state: &AppState, entry: AuditEntry) {
    match state.store.insert_audit_entry(&entry).await {
        Ok(()) => tracing::info!(
            action = %entry.action,
            table_name = %entry.table_name,
            record_id = %entry.record_id,
            user_id = entry.user_id.as_deref().unwrap_or("-"),
            tenant_id = %entry.tenant_id,
            "Audit log"
        ),
        Err(e) => tracing::error!(
            error = %e,
            action = %entry.action,
            table_name = %entry.table_name,
            record_id = %entry.record_id,
            "Failed to write audit entry"
        ),
    }
}
