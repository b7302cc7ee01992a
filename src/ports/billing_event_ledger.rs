//! Read and maintenance side of the processed-event ledger.
//!
//! Writes go through [`SubscriptionRepository::commit_event`] so they share
//! a transaction with the state change.
//!
//! [`SubscriptionRepository::commit_event`]: super::SubscriptionRepository::commit_event

use async_trait::async_trait;

use crate::domain::billing::BillingEvent;
use crate::domain::foundation::{DomainError, Timestamp};

#[async_trait]
pub trait BillingEventLedger: Send + Sync {
    async fn find_by_event_id(
        &self,
        provider_event_id: &str,
    ) -> Result<Option<BillingEvent>, DomainError>;

    /// True if an applied event referenced this provider subscription id.
    ///
    /// A subscription id that was applied once but no longer sits on any
    /// row was replaced by a later checkout.
    async fn knows_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<bool, DomainError>;

    /// Deletes rows processed before `cutoff`. Returns how many were removed.
    async fn prune_before(&self, cutoff: Timestamp) -> Result<u64, DomainError>;
}
