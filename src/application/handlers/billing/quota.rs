//! Quota queries over the subscription store and the lead counter.
//!
//! Read-only and uncached: every call counts leads at call time, so a lead
//! created a moment ago is always reflected.

use std::sync::Arc;

use crate::domain::billing::{BillingError, QuotaUsage, QuotaWindow, TierCatalog};
use crate::domain::foundation::{PractitionerId, Timestamp};
use crate::ports::{LeadCounter, SubscriptionRepository};

/// Computes lead usage against the practitioner's tier allowance.
pub struct QuotaAccountant {
    repository: Arc<dyn SubscriptionRepository>,
    lead_counter: Arc<dyn LeadCounter>,
    catalog: Arc<TierCatalog>,
}

impl QuotaAccountant {
    pub fn new(
        repository: Arc<dyn SubscriptionRepository>,
        lead_counter: Arc<dyn LeadCounter>,
        catalog: Arc<TierCatalog>,
    ) -> Self {
        Self {
            repository,
            lead_counter,
            catalog,
        }
    }

    /// Usage in the window containing `as_of`.
    pub async fn compute_usage(
        &self,
        practitioner_id: &PractitionerId,
        as_of: Timestamp,
    ) -> Result<QuotaUsage, BillingError> {
        let subscription = self.repository.get_current(practitioner_id).await?;
        let window = QuotaWindow::resolve(subscription.as_ref(), &self.catalog, as_of)?;
        let used = self
            .lead_counter
            .count_leads(practitioner_id, window.start, window.end)
            .await?;

        tracing::debug!(
            practitioner_id = %practitioner_id,
            tier = %window.tier,
            used,
            window_start = %window.start,
            window_end = %window.end,
            "Computed lead usage"
        );
        Ok(QuotaUsage::new(&window, used))
    }

    /// Current usage, limit, remaining and period end.
    pub async fn quota_status(
        &self,
        practitioner_id: &PractitionerId,
    ) -> Result<QuotaUsage, BillingError> {
        self.compute_usage(practitioner_id, Timestamp::now()).await
    }

    /// True if one more lead may be assigned now.
    pub async fn can_consume(&self, practitioner_id: &PractitionerId) -> Result<bool, BillingError> {
        Ok(self.quota_status(practitioner_id).await?.can_consume())
    }

    /// `QuotaExceeded` when no capacity is left.
    pub async fn require_capacity(
        &self,
        practitioner_id: &PractitionerId,
    ) -> Result<QuotaUsage, BillingError> {
        let usage = self.quota_status(practitioner_id).await?;
        usage.require_capacity()?;
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryLeadCounter, InMemorySubscriptionStore};
    use crate::domain::billing::{
        test_catalog, Activation, BillingCycle, BillingPeriod, Subscription, TierId,
    };
    use crate::domain::foundation::DomainError;
    use async_trait::async_trait;

    const JAN_1: i64 = 1_735_689_600;
    const DAY: i64 = 86_400;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_unix_secs(secs).unwrap()
    }

    fn practitioner() -> PractitionerId {
        PractitionerId::new("prac-1").unwrap()
    }

    async fn subscribed(store: &InMemorySubscriptionStore, tier: TierId, start: Timestamp) {
        let mut sub = Subscription::new(practitioner(), start);
        sub.activate(
            Activation {
                tier,
                cycle: BillingCycle::Monthly,
                period: BillingPeriod::starting_at(start, BillingCycle::Monthly),
                provider_customer_id: "cus_1".to_string(),
                provider_subscription_id: "sub_1".to_string(),
            },
            start,
        )
        .unwrap();
        store.upsert(&sub).await.unwrap();
    }

    fn accountant(
        store: Arc<InMemorySubscriptionStore>,
        leads: Arc<InMemoryLeadCounter>,
    ) -> QuotaAccountant {
        QuotaAccountant::new(store, leads, Arc::new(test_catalog()))
    }

    #[tokio::test]
    async fn professional_with_five_leads_is_exhausted() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let leads = Arc::new(InMemoryLeadCounter::new());
        subscribed(&store, TierId::Professional, ts(JAN_1)).await;
        for day in 0..5 {
            leads.record_lead(practitioner(), ts(JAN_1 + day * DAY));
        }

        let usage = accountant(store, leads)
            .compute_usage(&practitioner(), ts(JAN_1 + 10 * DAY))
            .await
            .unwrap();

        assert_eq!(usage.used, 5);
        assert_eq!(usage.limit, Some(5));
        assert_eq!(usage.remaining, Some(0));
        assert!(!usage.can_consume());
        assert!(matches!(
            usage.require_capacity(),
            Err(BillingError::QuotaExceeded { used: 5, limit: 5 })
        ));
    }

    #[tokio::test]
    async fn leads_outside_the_period_are_not_counted() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let leads = Arc::new(InMemoryLeadCounter::new());
        subscribed(&store, TierId::Starter, ts(JAN_1)).await;
        leads.record_lead(practitioner(), ts(JAN_1 - DAY));
        leads.record_lead(practitioner(), ts(JAN_1 + DAY));

        let usage = accountant(store, leads)
            .compute_usage(&practitioner(), ts(JAN_1 + 2 * DAY))
            .await
            .unwrap();

        assert_eq!(usage.used, 1);
        assert_eq!(usage.remaining, Some(1));
        assert!(usage.can_consume());
    }

    #[tokio::test]
    async fn elite_is_unlimited() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let leads = Arc::new(InMemoryLeadCounter::new());
        subscribed(&store, TierId::Elite, ts(JAN_1)).await;
        for i in 0..50 {
            leads.record_lead(practitioner(), ts(JAN_1 + i * 60));
        }

        let usage = accountant(store, leads)
            .compute_usage(&practitioner(), ts(JAN_1 + DAY))
            .await
            .unwrap();

        assert!(usage.unlimited);
        assert_eq!(usage.remaining, None);
        assert!(usage.can_consume());
    }

    #[tokio::test]
    async fn no_subscription_uses_free_calendar_month() {
        let accountant = accountant(
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(InMemoryLeadCounter::new()),
        );

        let usage = accountant
            .compute_usage(&practitioner(), ts(JAN_1 + 15 * DAY))
            .await
            .unwrap();

        assert_eq!(usage.tier, TierId::Free);
        assert_eq!(usage.period_start, ts(JAN_1));
        assert_eq!(usage.limit, Some(0));
        assert!(!usage.can_consume());
    }

    struct FailingCounter;

    #[async_trait]
    impl LeadCounter for FailingCounter {
        async fn count_leads(
            &self,
            _practitioner_id: &PractitionerId,
            _start: Timestamp,
            _end: Timestamp,
        ) -> Result<u64, DomainError> {
            Err(DomainError::database("leads table unavailable"))
        }
    }

    #[tokio::test]
    async fn counter_failure_is_persistence_error() {
        let accountant = QuotaAccountant::new(
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(FailingCounter),
            Arc::new(test_catalog()),
        );

        let err = accountant.can_consume(&practitioner()).await.unwrap_err();

        assert!(matches!(err, BillingError::Persistence(_)));
    }
}
