//! Subscription repository port.
//!
//! # Design
//!
//! - **One record per practitioner**: `get_current` is the primary lookup
//! - **Unique provider id**: `provider_subscription_id` identifies at most one record
//! - **Atomic commit**: ledger row and state write land together or not at all
//! - **Compare-and-swap**: a write carries the [`RowVersion`] it was computed
//!   from and is refused if the row moved on in the meantime

use async_trait::async_trait;

use crate::domain::billing::{BillingEvent, Subscription};
use crate::domain::foundation::{DomainError, PractitionerId, Timestamp};

/// Result of trying to record a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerInsert {
    /// First time this event id was seen; any state change was written.
    Inserted,
    /// Another delivery recorded it first; nothing was written.
    AlreadyRecorded,
    /// The subscription row changed after it was read; nothing was written.
    Conflict,
}

/// The practitioner's row as a write saw it when it read the row.
///
/// Every state write advances the applied-event watermark, so the watermark
/// pair identifies a row version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowVersion {
    /// No row existed for the practitioner.
    Absent,
    Watermark {
        event_id: Option<String>,
        event_at: Option<Timestamp>,
    },
}

impl RowVersion {
    pub fn of(read: Option<&Subscription>) -> Self {
        match read {
            None => RowVersion::Absent,
            Some(sub) => RowVersion::Watermark {
                event_id: sub.last_applied_event_id.clone(),
                event_at: sub.last_applied_event_at,
            },
        }
    }

    /// True if `stored` is still the row this version was taken from.
    pub fn matches(&self, stored: Option<&Subscription>) -> bool {
        *self == RowVersion::of(stored)
    }
}

/// A subscription write guarded by the version it was computed from.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionWrite<'a> {
    pub subscription: &'a Subscription,
    pub read: &'a RowVersion,
}

impl<'a> SubscriptionWrite<'a> {
    pub fn new(subscription: &'a Subscription, read: &'a RowVersion) -> Self {
        Self { subscription, read }
    }
}

/// Repository port for Subscription persistence.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// The practitioner's subscription, if one was ever created.
    async fn get_current(
        &self,
        practitioner_id: &PractitionerId,
    ) -> Result<Option<Subscription>, DomainError>;

    /// Lookup by the provider's subscription id.
    async fn get_by_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>, DomainError>;

    /// Insert or replace the practitioner's subscription.
    ///
    /// # Errors
    ///
    /// - `DatabaseError` on persistence failure, including a
    ///   `provider_subscription_id` already owned by another practitioner
    async fn upsert(&self, subscription: &Subscription) -> Result<(), DomainError>;

    /// Writes the subscription only if the practitioner's row still matches
    /// `read`. Returns false, writing nothing, if it moved on.
    async fn upsert_if_unchanged(
        &self,
        subscription: &Subscription,
        read: &RowVersion,
    ) -> Result<bool, DomainError>;

    /// ACTIVE or PAST_DUE subscriptions whose period ended or whose grace
    /// deadline passed at or before `as_of`.
    async fn list_expired_unconfirmed(
        &self,
        as_of: Timestamp,
    ) -> Result<Vec<Subscription>, DomainError>;

    /// Inserts the ledger row and, if given, writes the subscription in one
    /// transaction. Neither is written if the event id is already recorded
    /// or the row no longer matches the write's version.
    async fn commit_event(
        &self,
        event: &BillingEvent,
        write: Option<SubscriptionWrite<'_>>,
    ) -> Result<LedgerInsert, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::domain::foundation::PractitionerId;

    #[test]
    fn subscription_repository_is_object_safe() {
        fn _accepts_dyn(_repo: &dyn SubscriptionRepository) {}
    }

    #[test]
    fn absent_version_only_matches_a_missing_row() {
        let sub = Subscription::new(
            PractitionerId::new("prac-1").unwrap(),
            Timestamp::from_unix_secs(1_735_689_600).unwrap(),
        );
        assert!(RowVersion::Absent.matches(None));
        assert!(!RowVersion::Absent.matches(Some(&sub)));
    }

    #[test]
    fn version_moves_with_the_watermark() {
        let mut sub = Subscription::new(
            PractitionerId::new("prac-1").unwrap(),
            Timestamp::from_unix_secs(1_735_689_600).unwrap(),
        );
        let read = RowVersion::of(Some(&sub));
        assert!(read.matches(Some(&sub)));

        sub.last_applied_event_id = Some("evt_1".to_string());
        assert!(!read.matches(Some(&sub)));
    }
}
