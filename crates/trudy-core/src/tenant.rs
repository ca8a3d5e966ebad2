//! Tenant types.
//!
//! A tenant (a "client" in product language) owns agents, calls, campaigns and
//! a credit balance. The balance stored here is a cache of the tenant's ledger;
//! it only ever changes together with a ledger entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TenantId;

/// A tenant account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// The tenant ID.
    pub id: TenantId,

    /// Display name.
    pub name: String,

    /// Cached credit balance (sum of the tenant's ledger entries).
    pub credits_balance: i64,

    /// Subscription status mirrored from the payment processor.
    pub subscription_status: SubscriptionStatus,

    /// Stripe customer ID, once the tenant has paid.
    pub stripe_customer_id: Option<String>,

    /// When the tenant was created.
    pub created_at: DateTime<Utc>,

    /// When the tenant was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Create a new tenant with zero balance and an active subscription.
    #[must_use]
    pub fn new(id: TenantId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            credits_balance: 0,
            subscription_status: SubscriptionStatus::Active,
            stripe_customer_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the tenant can cover a spend of `amount` credits.
    #[must_use]
    pub fn has_sufficient_credits(&self, amount: i64) -> bool {
        self.credits_balance >= amount
    }
}

str_enum! {
    /// Local subscription status.
    pub enum SubscriptionStatus("subscription status") {
        /// Paying or trialing.
        Active => "active",
        /// Payment problems; service may be restricted.
        Suspended => "suspended",
        /// Subscription ended.
        Cancelled => "cancelled",
    }
}

impl SubscriptionStatus {
    /// Map a Stripe subscription status onto the local vocabulary.
    ///
    /// Returns `None` for statuses the table does not cover; callers decide the
    /// fallback (see [`SubscriptionStatus::from_stripe_or_active`]).
    #[must_use]
    pub fn from_stripe(status: &str) -> Option<Self> {
        match status {
            "active" | "trialing" => Some(Self::Active),
            "past_due" | "unpaid" | "incomplete" | "paused" => Some(Self::Suspended),
            "canceled" | "incomplete_expired" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Map a Stripe status, treating unmapped values as `Active`.
    ///
    /// The boolean is `false` when the fallback was used so the caller can log
    /// the miscategorization risk.
    #[must_use]
    pub fn from_stripe_or_active(status: &str) -> (Self, bool) {
        Self::from_stripe(status).map_or((Self::Active, false), |mapped| (mapped, true))
    }
}

str_enum! {
    /// Caller role carried in the JWT `role` claim.
    pub enum Role("role") {
        /// Regular member of a tenant.
        ClientUser => "client_user",
        /// Administrator of a single tenant.
        ClientAdmin => "client_admin",
        /// Agency-wide administrator; may act for any tenant.
        AgencyAdmin => "agency_admin",
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::ClientUser
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tenant_has_zero_balance() {
        let tenant = Tenant::new(TenantId::generate(), "Acme");
        assert_eq!(tenant.credits_balance, 0);
        assert_eq!(tenant.subscription_status, SubscriptionStatus::Active);
        assert!(tenant.has_sufficient_credits(0));
        assert!(!tenant.has_sufficient_credits(1));
    }

    #[test]
    fn stripe_status_mapping_table() {
        let cases = [
            ("active", SubscriptionStatus::Active),
            ("trialing", SubscriptionStatus::Active),
            ("past_due", SubscriptionStatus::Suspended),
            ("unpaid", SubscriptionStatus::Suspended),
            ("incomplete", SubscriptionStatus::Suspended),
            ("paused", SubscriptionStatus::Suspended),
            ("canceled", SubscriptionStatus::Cancelled),
            ("incomplete_expired", SubscriptionStatus::Cancelled),
        ];
        for (stripe, expected) in cases {
            assert_eq!(SubscriptionStatus::from_stripe(stripe), Some(expected), "{stripe}");
            assert_eq!(SubscriptionStatus::from_stripe_or_active(stripe), (expected, true));
        }
    }

    #[test]
    fn unmapped_stripe_status_falls_back_to_active() {
        assert_eq!(SubscriptionStatus::from_stripe("something_new"), None);
        assert_eq!(
            SubscriptionStatus::from_stripe_or_active("something_new"),
            (SubscriptionStatus::Active, false)
        );
    }

    #[test]
    fn role_parses_claim_strings() {
        assert_eq!("agency_admin".parse::<Role>().unwrap(), Role::AgencyAdmin);
        assert_eq!(Role::default(), Role::ClientUser);
        assert!("root".parse::<Role>().is_err());
    }
}
