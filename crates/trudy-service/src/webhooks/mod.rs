//! Provider webhooks: ingress verification and reconciliation, egress
//! delivery to tenant endpoints.

pub mod egress;
pub mod reconciler;
pub mod signature;
