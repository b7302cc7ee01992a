//! In-memory subscription store and event ledger.
//!
//! One mutex guards both maps, so `commit_event` is as atomic as the
//! PostgreSQL transaction it stands in for. Failure injection lets tests
//! exercise the persistence-failure path.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::domain::billing::{BillingEvent, EventOutcome, Subscription};
use crate::domain::foundation::{DomainError, PractitionerId, Timestamp};
use crate::ports::{
    BillingEventLedger, LedgerInsert, RowVersion, SubscriptionRepository, SubscriptionWrite,
};

#[derive(Default)]
struct State {
    /// Keyed by practitioner id.
    subscriptions: HashMap<String, Subscription>,
    /// Keyed by provider event id.
    events: HashMap<String, BillingEvent>,
}

impl State {
    fn version_matches(&self, write: &SubscriptionWrite<'_>) -> bool {
        let stored = self
            .subscriptions
            .get(write.subscription.practitioner_id.as_str());
        write.read.matches(stored)
    }

    fn write(&mut self, subscription: &Subscription) -> Result<(), DomainError> {
        if let Some(provider_id) = &subscription.provider_subscription_id {
            let taken = self.subscriptions.values().any(|s| {
                s.practitioner_id != subscription.practitioner_id
                    && s.provider_subscription_id.as_ref() == Some(provider_id)
            });
            if taken {
                return Err(DomainError::database(format!(
                    "provider subscription {} belongs to another practitioner",
                    provider_id
                )));
            }
        }
        self.subscriptions.insert(
            subscription.practitioner_id.as_str().to_string(),
            subscription.clone(),
        );
        Ok(())
    }
}

/// In-memory implementation of the subscription and ledger ports.
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    state: Mutex<State>,
    fail_writes: AtomicBool,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail with a database error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(&self) -> Result<(), DomainError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DomainError::database("injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionStore {
    async fn get_current(
        &self,
        practitioner_id: &PractitionerId,
    ) -> Result<Option<Subscription>, DomainError> {
        Ok(self.lock().subscriptions.get(practitioner_id.as_str()).cloned())
    }

    async fn get_by_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>, DomainError> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| s.provider_subscription_id.as_deref() == Some(provider_subscription_id))
            .cloned())
    }

    async fn upsert(&self, subscription: &Subscription) -> Result<(), DomainError> {
        self.check_writable()?;
        self.lock().write(subscription)
    }

    async fn upsert_if_unchanged(
        &self,
        subscription: &Subscription,
        read: &RowVersion,
    ) -> Result<bool, DomainError> {
        self.check_writable()?;
        let mut state = self.lock();
        if !state.version_matches(&SubscriptionWrite::new(subscription, read)) {
            return Ok(false);
        }
        state.write(subscription)?;
        Ok(true)
    }

    async fn list_expired_unconfirmed(
        &self,
        as_of: Timestamp,
    ) -> Result<Vec<Subscription>, DomainError> {
        let mut expired: Vec<Subscription> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.needs_reconciliation(as_of))
            .cloned()
            .collect();
        expired.sort_by_key(|s| s.current_period_end);
        Ok(expired)
    }

    async fn commit_event(
        &self,
        event: &BillingEvent,
        write: Option<SubscriptionWrite<'_>>,
    ) -> Result<LedgerInsert, DomainError> {
        self.check_writable()?;
        let mut state = self.lock();
        if state.events.contains_key(&event.provider_event_id) {
            return Ok(LedgerInsert::AlreadyRecorded);
        }
        if let Some(write) = write {
            if !state.version_matches(&write) {
                return Ok(LedgerInsert::Conflict);
            }
            state.write(write.subscription)?;
        }
        state
            .events
            .insert(event.provider_event_id.clone(), event.clone());
        Ok(LedgerInsert::Inserted)
    }
}

#[async_trait]
impl BillingEventLedger for InMemorySubscriptionStore {
    async fn find_by_event_id(
        &self,
        provider_event_id: &str,
    ) -> Result<Option<BillingEvent>, DomainError> {
        Ok(self.lock().events.get(provider_event_id).cloned())
    }

    async fn knows_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<bool, DomainError> {
        Ok(self.lock().events.values().any(|e| {
            e.outcome == EventOutcome::Applied
                && e.provider_subscription_id.as_deref() == Some(provider_subscription_id)
        }))
    }

    async fn prune_before(&self, cutoff: Timestamp) -> Result<u64, DomainError> {
        self.check_writable()?;
        let mut state = self.lock();
        let before = state.events.len();
        state.events.retain(|_, e| e.processed_at >= cutoff);
        Ok((before - state.events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billing::{Activation, BillingCycle, BillingPeriod, TierId};

    fn t(secs: i64) -> Timestamp {
        Timestamp::from_unix_secs(1_735_689_600 + secs).unwrap()
    }

    fn active(practitioner: &str, provider_id: &str) -> Subscription {
        let mut sub = Subscription::new(PractitionerId::new(practitioner).unwrap(), t(0));
        sub.activate(
            Activation {
                tier: TierId::Starter,
                cycle: BillingCycle::Monthly,
                period: BillingPeriod::starting_at(t(0), BillingCycle::Monthly),
                provider_customer_id: "cus_1".to_string(),
                provider_subscription_id: provider_id.to_string(),
            },
            t(0),
        )
        .unwrap();
        sub
    }

    fn event(id: &str, processed_at: Timestamp) -> BillingEvent {
        BillingEvent::new(id, "invoice.paid", processed_at, processed_at, EventOutcome::Applied)
    }

    static ABSENT: RowVersion = RowVersion::Absent;

    fn fresh(sub: &Subscription) -> SubscriptionWrite<'_> {
        SubscriptionWrite::new(sub, &ABSENT)
    }

    #[tokio::test]
    async fn commit_writes_ledger_and_state_together() {
        let store = InMemorySubscriptionStore::new();
        let sub = active("prac-1", "sub_1");

        let result = store.commit_event(&event("evt_1", t(0)), Some(fresh(&sub))).await.unwrap();
        assert_eq!(result, LedgerInsert::Inserted);
        assert!(store.find_by_event_id("evt_1").await.unwrap().is_some());
        assert_eq!(
            store.get_by_subscription_id("sub_1").await.unwrap().unwrap().practitioner_id,
            sub.practitioner_id
        );
    }

    #[tokio::test]
    async fn second_commit_of_same_event_writes_nothing() {
        let store = InMemorySubscriptionStore::new();
        let sub = active("prac-1", "sub_1");
        store.commit_event(&event("evt_1", t(0)), Some(fresh(&sub))).await.unwrap();

        let mut changed = sub.clone();
        changed.tier = TierId::Elite;
        let result = store.commit_event(&event("evt_1", t(0)), Some(fresh(&changed))).await.unwrap();

        assert_eq!(result, LedgerInsert::AlreadyRecorded);
        let stored = store.get_current(&sub.practitioner_id).await.unwrap().unwrap();
        assert_eq!(stored.tier, TierId::Starter);
    }

    #[tokio::test]
    async fn commit_against_a_moved_row_writes_nothing() {
        let store = InMemorySubscriptionStore::new();
        let read = active("prac-1", "sub_1");
        store.upsert(&read).await.unwrap();
        let version = RowVersion::of(Some(&read));

        let mut winner = read.clone();
        winner.record_applied("evt_a", t(10)).unwrap();
        store
            .commit_event(
                &event("evt_a", t(10)),
                Some(SubscriptionWrite::new(&winner, &version)),
            )
            .await
            .unwrap();

        let mut loser = read.clone();
        loser.tier = TierId::Elite;
        loser.record_applied("evt_b", t(20)).unwrap();
        let result = store
            .commit_event(
                &event("evt_b", t(20)),
                Some(SubscriptionWrite::new(&loser, &version)),
            )
            .await
            .unwrap();

        assert_eq!(result, LedgerInsert::Conflict);
        assert!(store.find_by_event_id("evt_b").await.unwrap().is_none());
        let stored = store.get_current(&read.practitioner_id).await.unwrap().unwrap();
        assert_eq!(stored.tier, TierId::Starter);
        assert_eq!(stored.last_applied_event_id.as_deref(), Some("evt_a"));
    }

    #[tokio::test]
    async fn fresh_write_conflicts_with_a_row_created_meanwhile() {
        let store = InMemorySubscriptionStore::new();
        store.upsert(&active("prac-1", "sub_1")).await.unwrap();

        let late = active("prac-1", "sub_2");
        let result = store
            .commit_event(&event("evt_1", t(0)), Some(fresh(&late)))
            .await
            .unwrap();

        assert_eq!(result, LedgerInsert::Conflict);
        assert!(store.get_by_subscription_id("sub_2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conditional_upsert_refuses_a_moved_row() {
        let store = InMemorySubscriptionStore::new();
        let read = active("prac-1", "sub_1");
        store.upsert(&read).await.unwrap();
        let version = RowVersion::of(Some(&read));

        let mut moved = read.clone();
        moved.record_applied("evt_a", t(10)).unwrap();
        assert!(store.upsert_if_unchanged(&moved, &version).await.unwrap());

        let mut stale = read.clone();
        stale.tier = TierId::Elite;
        assert!(!store.upsert_if_unchanged(&stale, &version).await.unwrap());
        let stored = store.get_current(&read.practitioner_id).await.unwrap().unwrap();
        assert_eq!(stored.tier, TierId::Starter);
    }

    #[tokio::test]
    async fn knows_subscriptions_seen_in_applied_events() {
        let store = InMemorySubscriptionStore::new();
        store
            .commit_event(&event("evt_1", t(0)).for_subscription("sub_1"), None)
            .await
            .unwrap();
        let ignored = BillingEvent::new("evt_2", "invoice.paid", t(0), t(0), EventOutcome::Ignored)
            .for_subscription("sub_2");
        store.commit_event(&ignored, None).await.unwrap();

        assert!(store.knows_subscription("sub_1").await.unwrap());
        assert!(!store.knows_subscription("sub_2").await.unwrap());
        assert!(!store.knows_subscription("sub_3").await.unwrap());
    }

    #[tokio::test]
    async fn injected_failure_leaves_no_ledger_row() {
        let store = InMemorySubscriptionStore::new();
        store.fail_writes(true);

        let sub = active("prac-1", "sub_1");
        assert!(store.commit_event(&event("evt_1", t(0)), Some(fresh(&sub))).await.is_err());
        assert_eq!(store.event_count(), 0);
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn provider_subscription_id_is_unique() {
        let store = InMemorySubscriptionStore::new();
        store.upsert(&active("prac-1", "sub_1")).await.unwrap();
        assert!(store.upsert(&active("prac-2", "sub_1")).await.is_err());
    }

    #[tokio::test]
    async fn lists_only_lapsed_billing_subscriptions() {
        let store = InMemorySubscriptionStore::new();
        let lapsed = active("prac-1", "sub_1");
        let mut canceled = active("prac-2", "sub_2");
        canceled.end_to_free(t(1)).unwrap();
        store.upsert(&lapsed).await.unwrap();
        store.upsert(&canceled).await.unwrap();

        let as_of = lapsed.current_period_end;
        let expired = store.list_expired_unconfirmed(as_of).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].provider_subscription_id.as_deref(), Some("sub_1"));

        assert!(store.list_expired_unconfirmed(t(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_removes_rows_processed_before_cutoff() {
        let store = InMemorySubscriptionStore::new();
        store.commit_event(&event("evt_old", t(0)), None).await.unwrap();
        store.commit_event(&event("evt_new", t(100)), None).await.unwrap();

        assert_eq!(store.prune_before(t(50)).await.unwrap(), 1);
        assert!(store.find_by_event_id("evt_old").await.unwrap().is_none());
        assert!(store.find_by_event_id("evt_new").await.unwrap().is_some());
    }
}
