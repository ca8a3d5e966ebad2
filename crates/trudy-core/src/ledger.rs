//! Credit ledger types.
//!
//! The ledger is append-only and is the source of truth for a tenant's
//! balance. Every entry carries a reference (`call`, `voice` or
//! `stripe_payment` plus an ID); the store enforces uniqueness of
//! `(tenant_id, type, reference_type, reference_id)`, which is what makes
//! webhook redelivery harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::{LedgerEntryId, TenantId};

/// Credits spent when a native voice clone starts training.
pub const NATIVE_VOICE_TRAINING_CREDITS: i64 = 50;

str_enum! {
    /// Direction of a ledger entry.
    pub enum LedgerEntryType("ledger entry type") {
        /// Credits added (payments).
        Purchased => "purchased",
        /// Credits consumed (calls, voice training).
        Spent => "spent",
    }
}

str_enum! {
    /// What a ledger entry is about.
    pub enum ReferenceType("reference type") {
        /// A completed call.
        Call => "call",
        /// A native voice training job.
        Voice => "voice",
        /// A Stripe payment intent.
        StripePayment => "stripe_payment",
    }
}

/// A single credit ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLedgerEntry {
    /// Entry ID (time-ordered).
    pub id: LedgerEntryId,

    /// Owning tenant.
    pub tenant_id: TenantId,

    /// Whether credits were added or consumed.
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,

    /// Always positive; the sign comes from `entry_type`.
    pub amount: i64,

    /// Kind of the referenced record.
    pub reference_type: ReferenceType,

    /// ID of the referenced record (call ID, voice ID, payment intent ID).
    pub reference_id: String,

    /// Human readable description.
    pub description: String,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl CreditLedgerEntry {
    fn new(
        tenant_id: TenantId,
        entry_type: LedgerEntryType,
        amount: i64,
        reference_type: ReferenceType,
        reference_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, DomainError> {
        if amount <= 0 {
            return Err(DomainError::InvalidAmount(amount));
        }
        Ok(Self {
            id: LedgerEntryId::generate(),
            tenant_id,
            entry_type,
            amount,
            reference_type,
            reference_id: reference_id.into(),
            description: description.into(),
            created_at: Utc::now(),
        })
    }

    /// A credit purchase.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidAmount` unless `amount` is positive.
    pub fn purchased(
        tenant_id: TenantId,
        amount: i64,
        reference_type: ReferenceType,
        reference_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, DomainError> {
        Self::new(
            tenant_id,
            LedgerEntryType::Purchased,
            amount,
            reference_type,
            reference_id,
            description,
        )
    }

    /// A credit spend.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidAmount` unless `amount` is positive.
    pub fn spent(
        tenant_id: TenantId,
        amount: i64,
        reference_type: ReferenceType,
        reference_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, DomainError> {
        Self::new(
            tenant_id,
            LedgerEntryType::Spent,
            amount,
            reference_type,
            reference_id,
            description,
        )
    }

    /// Signed effect of this entry on the balance.
    #[must_use]
    pub const fn delta(&self) -> i64 {
        match self.entry_type {
            LedgerEntryType::Purchased => self.amount,
            LedgerEntryType::Spent => -self.amount,
        }
    }

    /// The uniqueness key the store deduplicates on.
    #[must_use]
    pub fn dedup_key(&self) -> (TenantId, LedgerEntryType, ReferenceType, &str) {
        (
            self.tenant_id,
            self.entry_type,
            self.reference_type,
            self.reference_id.as_str(),
        )
    }
}

/// Longest call duration accepted from the provider, in seconds (24 hours).
pub const MAX_CALL_DURATION_SECONDS: i64 = 86_400;

/// Credits billed for a call of `duration_seconds`.
///
/// Calls are billed per started minute with a one credit minimum, so a zero
/// or negative duration still costs 1.
#[must_use]
pub fn billed_minutes(duration_seconds: i64) -> i64 {
    let seconds = duration_seconds.max(0);
    (seconds.saturating_add(59) / 60).max(1)
}

/// Whole seconds for a provider-reported call duration.
///
/// Absent or negative durations count as zero; fractions round up.
///
/// # Errors
///
/// Returns [`DomainError::InvalidDuration`] for a non-finite duration or one
/// longer than [`MAX_CALL_DURATION_SECONDS`].
pub fn call_duration_seconds(reported: Option<f64>) -> Result<i64, DomainError> {
    let seconds = reported.unwrap_or(0.0);
    #[allow(clippy::cast_precision_loss)]
    let max = MAX_CALL_DURATION_SECONDS as f64;
    if !seconds.is_finite() || seconds > max {
        return Err(DomainError::InvalidDuration(seconds.to_string()));
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(seconds.max(0.0).ceil() as i64)
}

/// Credits bought by a payment of `amount_cents`.
#[must_use]
pub const fn credits_for_cents(amount_cents: i64) -> i64 {
    amount_cents / 100
}

/// Balance implied by a set of ledger entries.
pub fn balance_of<'a>(entries: impl IntoIterator<Item = &'a CreditLedgerEntry>) -> i64 {
    entries.into_iter().map(CreditLedgerEntry::delta).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_rounds_up_to_started_minutes() {
        assert_eq!(billed_minutes(0), 1);
        assert_eq!(billed_minutes(-5), 1);
        assert_eq!(billed_minutes(1), 1);
        assert_eq!(billed_minutes(60), 1);
        assert_eq!(billed_minutes(61), 2);
        assert_eq!(billed_minutes(125), 3);
        assert_eq!(billed_minutes(3600), 60);
    }

    #[test]
    fn billing_saturates_instead_of_overflowing() {
        assert_eq!(billed_minutes(i64::MAX), i64::MAX / 60);
        assert_eq!(billed_minutes(i64::MIN), 1);
    }

    #[test]
    fn reported_durations_are_bounded() {
        assert_eq!(call_duration_seconds(None), Ok(0));
        assert_eq!(call_duration_seconds(Some(-3.0)), Ok(0));
        assert_eq!(call_duration_seconds(Some(60.2)), Ok(61));
        assert_eq!(
            call_duration_seconds(Some(86_400.0)),
            Ok(MAX_CALL_DURATION_SECONDS)
        );
        assert!(call_duration_seconds(Some(86_400.5)).is_err());
        assert!(call_duration_seconds(Some(1e19)).is_err());
        assert!(call_duration_seconds(Some(f64::NAN)).is_err());
        assert!(call_duration_seconds(Some(f64::INFINITY)).is_err());
    }

    #[test]
    fn cents_convert_to_whole_credits() {
        assert_eq!(credits_for_cents(2500), 25);
        assert_eq!(credits_for_cents(2599), 25);
        assert_eq!(credits_for_cents(99), 0);
    }

    #[test]
    fn entries_reject_non_positive_amounts() {
        let tenant = TenantId::generate();
        assert_eq!(
            CreditLedgerEntry::spent(tenant, 0, ReferenceType::Call, "c", "x"),
            Err(DomainError::InvalidAmount(0))
        );
        assert!(CreditLedgerEntry::purchased(tenant, -3, ReferenceType::StripePayment, "pi", "x").is_err());
    }

    #[test]
    fn balance_is_purchases_minus_spends() {
        let tenant = TenantId::generate();
        let entries = vec![
            CreditLedgerEntry::purchased(tenant, 25, ReferenceType::StripePayment, "pi_1", "top up").unwrap(),
            CreditLedgerEntry::spent(tenant, 3, ReferenceType::Call, "call_1", "call").unwrap(),
            CreditLedgerEntry::spent(tenant, 50, ReferenceType::Voice, "voice_1", "training").unwrap(),
        ];
        assert_eq!(balance_of(&entries), -28);
    }

    #[test]
    fn ledger_entry_serializes_type_field() {
        let entry =
            CreditLedgerEntry::spent(TenantId::generate(), 3, ReferenceType::Call, "abc", "call").unwrap();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "spent");
        assert_eq!(json["reference_type"], "call");
        assert_eq!(json["amount"], 3);
    }
}
