//! Strongly-typed identifiers.
//!
//! Every record kind gets its own newtype so a `CallId` can never be passed
//! where a `VoiceId` is expected. All IDs travel as plain strings on the wire.
//! Most wrap a random v4 UUID; ledger and audit entries wrap a ULID so they
//! sort by creation time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Define an ID newtype around `$inner`.
///
/// `$new` generates a fresh value and `$parse` turns a `&str` into
/// `Result<$inner, IdError>`.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty) { new: $new:expr, parse: $parse:expr $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name($inner);

        impl $name {
            /// Generate a fresh identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self($new)
            }

            /// Wrap an existing value.
            #[must_use]
            pub const fn from_inner(inner: $inner) -> Self {
                Self(inner)
            }

            /// The wrapped value.
            #[must_use]
            pub const fn inner(&self) -> &$inner {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, IdError> {
                ($parse)(s).map(Self)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, IdError> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid, IdError> {
    uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)
}

fn parse_ulid(s: &str) -> Result<Ulid, IdError> {
    Ulid::from_string(s).map_err(|_| IdError::InvalidUlid)
}

/// UUID-backed IDs, one per record kind.
macro_rules! uuid_ids {
    ($($(#[$meta:meta])* $name:ident;)+) => {
        $(
            id_type!($(#[$meta])* $name(uuid::Uuid) {
                new: uuid::Uuid::new_v4(),
                parse: parse_uuid,
            });
        )+
    };
}

uuid_ids! {
    /// A tenant ("client"): the billing and isolation boundary. Every domain
    /// record belongs to exactly one.
    TenantId;
    /// A call.
    CallId;
    /// An agent.
    AgentId;
    /// A voice.
    VoiceId;
    /// A campaign.
    CampaignId;
    /// A campaign contact.
    ContactId;
    /// A knowledge base.
    KnowledgeBaseId;
    /// A tool.
    ToolId;
    /// A tenant-registered egress webhook endpoint.
    WebhookEndpointId;
    /// One egress webhook delivery.
    DeliveryId;
    /// A tenant's stored third-party API key.
    ApiKeyId;
}

id_type! {
    /// A credit ledger entry. Time-ordered, so a tenant's ledger sorts
    /// chronologically by ID alone.
    LedgerEntryId(Ulid) {
        new: Ulid::new(),
        parse: parse_ulid,
    }
}

id_type! {
    /// An audit log entry. Time-ordered like ledger entries.
    AuditEntryId(Ulid) {
        new: Ulid::new(),
        parse: parse_ulid,
    }
}

/// Identifier parse failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Not a UUID.
    #[error("invalid UUID format")]
    InvalidUuid,

    /// Not a ULID.
    #[error("invalid ULID format")]
    InvalidUlid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_travel_as_plain_strings() {
        let id = CallId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        assert_eq!(serde_json::from_str::<CallId>(&json).unwrap(), id);
        assert_eq!(format!("{id:?}"), format!("CallId({id})"));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert_eq!(TenantId::from_str("client-1"), Err(IdError::InvalidUuid));
        assert!(serde_json::from_str::<AgentId>("\"nope\"").is_err());
        assert_eq!(
            LedgerEntryId::from_str("not-a-ulid"),
            Err(IdError::InvalidUlid)
        );
    }

    #[test]
    fn ledger_entry_ids_sort_by_creation() {
        let first = LedgerEntryId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = LedgerEntryId::generate();
        assert!(first < second);
        assert_eq!(LedgerEntryId::from_str(&first.to_string()).unwrap(), first);
    }
}
