//! Audit log entries.
//!
//! One entry per tenant-visible mutation: who did what to which record.
//! Entries are append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AuditEntryId, TenantId};

str_enum! {
    /// The kind of mutation recorded.
    pub enum AuditAction("audit action") {
        /// A record was created.
        Insert => "insert",
        /// A record was changed.
        Update => "update",
        /// A record was removed.
        Delete => "delete",
    }
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry ID (time-ordered).
    pub id: AuditEntryId,
    /// Tenant the record belongs to.
    #[serde(rename = "client_id")]
    pub tenant_id: TenantId,
    /// Subject of the token that made the change, when known.
    pub user_id: Option<String>,
    /// What happened.
    pub action: AuditAction,
    /// Kind of record, named after its table (`agents`, `api_keys`, ...).
    pub table_name: String,
    /// ID of the record.
    pub record_id: String,
    /// Changed fields, as `{field: {before, after}}` for updates.
    pub diff: serde_json::Value,
    /// Free-form context.
    pub metadata: serde_json::Value,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// An entry with an empty diff and metadata.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        action: AuditAction,
        table_name: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            id: AuditEntryId::generate(),
            tenant_id,
            user_id: None,
            action,
            table_name: table_name.into(),
            record_id: record_id.into(),
            diff: serde_json::json!({}),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    /// Attribute the entry to `user_id`.
    #[must_use]
    pub fn by(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a diff.
    #[must_use]
    pub fn with_diff(mut self, diff: serde_json::Value) -> Self {
        self.diff = diff;
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Top-level fields that differ between two JSON objects, as
/// `{field: {"before": old, "after": new}}`.
///
/// Fields present on only one side are reported with `null` on the other.
/// Non-object inputs compare as a single `"value"` field.
#[must_use]
pub fn field_diff(before: &serde_json::Value, after: &serde_json::Value) -> serde_json::Value {
    use serde_json::{Map, Value};

    let (Value::Object(old), Value::Object(new)) = (before, after) else {
        if before == after {
            return Value::Object(Map::new());
        }
        return serde_json::json!({ "value": { "before": before, "after": after } });
    };

    let mut changed = Map::new();
    for (field, old_value) in old {
        let new_value = new.get(field).unwrap_or(&Value::Null);
        if old_value != new_value {
            changed.insert(
                field.clone(),
                serde_json::json!({ "before": old_value, "after": new_value }),
            );
        }
    }
    for (field, new_value) in new {
        if !old.contains_key(field) {
            changed.insert(
                field.clone(),
                serde_json::json!({ "before": Value::Null, "after": new_value }),
            );
        }
    }
    Value::Object(changed)
}
