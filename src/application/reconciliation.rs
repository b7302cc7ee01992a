//! Reconciliation job.
//!
//! Webhooks can be lost or arrive late. On an interval the job finds billing
//! subscriptions whose period lapsed or whose grace ran out, asks the provider
//! for the truth, and corrects local state. When the provider cannot be
//! reached only rules decidable locally are applied.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::application::SubscriptionLocks;
use crate::domain::billing::{
    BillingPeriod, ChangeSource, ProviderSnapshot, Subscription, SubscriptionChanged, TierCatalog,
};
use crate::domain::foundation::{DomainError, Timestamp};
use crate::ports::{
    BillingEventLedger, EventPublisher, PaymentProvider, ProviderSubscription,
    RowVersion, SubscriptionRepository,
};

/// Job knobs.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub interval: Duration,
    /// Candidates processed at once.
    pub concurrency: usize,
    /// Bound on each provider call.
    pub provider_timeout: Duration,
    pub grace_period: chrono::Duration,
    pub ledger_retention: chrono::Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            concurrency: 8,
            provider_timeout: Duration::from_secs(10),
            grace_period: chrono::Duration::days(7),
            ledger_retention: chrono::Duration::days(90),
        }
    }
}

/// Counts from one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub corrected: usize,
    /// Held or rewritten by an in-flight webhook; picked up next pass.
    pub skipped_locked: usize,
    /// Provider unreachable or store write failed.
    pub failed: usize,
}

impl ReconcileReport {
    fn add(&mut self, outcome: CandidateOutcome) {
        self.examined += 1;
        match outcome {
            CandidateOutcome::Unchanged => {}
            CandidateOutcome::Corrected => self.corrected += 1,
            CandidateOutcome::SkippedLocked => self.skipped_locked += 1,
            CandidateOutcome::Failed { corrected } => {
                self.failed += 1;
                if corrected {
                    self.corrected += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
    Unchanged,
    Corrected,
    SkippedLocked,
    /// Provider call failed. Local rules may still have corrected it.
    Failed { corrected: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Saved {
    Written,
    /// The row changed after it was reloaded; nothing was written.
    Moved,
    Failed,
}

pub struct ReconciliationJob {
    repository: Arc<dyn SubscriptionRepository>,
    ledger: Arc<dyn BillingEventLedger>,
    payment_provider: Arc<dyn PaymentProvider>,
    publisher: Arc<dyn EventPublisher>,
    catalog: Arc<TierCatalog>,
    locks: Arc<SubscriptionLocks>,
    settings: ReconcileSettings,
    /// Single-flight guard for passes.
    running: Mutex<()>,
}

impl ReconciliationJob {
    pub fn new(
        repository: Arc<dyn SubscriptionRepository>,
        ledger: Arc<dyn BillingEventLedger>,
        payment_provider: Arc<dyn PaymentProvider>,
        publisher: Arc<dyn EventPublisher>,
        catalog: Arc<TierCatalog>,
        locks: Arc<SubscriptionLocks>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            repository,
            ledger,
            payment_provider,
            publisher,
            catalog,
            locks,
            settings,
            running: Mutex::new(()),
        }
    }

    /// Runs one pass as of now. `None` if a pass is already running.
    pub async fn run_once(&self) -> Result<Option<ReconcileReport>, DomainError> {
        self.run_at(Timestamp::now()).await
    }

    /// Runs one pass as of `now`.
    ///
    /// # Errors
    ///
    /// Only a failure to list candidates. Per-subscription failures are
    /// counted in the report.
    pub async fn run_at(&self, now: Timestamp) -> Result<Option<ReconcileReport>, DomainError> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::info!("Reconciliation pass already running, skipping");
            return Ok(None);
        };

        let candidates = self.repository.list_expired_unconfirmed(now).await?;
        let concurrency = self.settings.concurrency.max(1);

        let report = stream::iter(candidates)
            .map(|candidate| self.reconcile_one(candidate, now))
            .buffer_unordered(concurrency)
            .fold(ReconcileReport::default(), |mut report, outcome| async move {
                report.add(outcome);
                report
            })
            .await;

        self.prune_ledger(now).await;
        self.locks.prune();

        tracing::info!(
            examined = report.examined,
            corrected = report.corrected,
            skipped_locked = report.skipped_locked,
            failed = report.failed,
            "Reconciliation pass finished"
        );
        Ok(Some(report))
    }

    async fn reconcile_one(&self, candidate: Subscription, now: Timestamp) -> CandidateOutcome {
        let practitioner_id = candidate.practitioner_id.clone();

        let Some(provider_id) = candidate.provider_subscription_id.clone() else {
            // Billing without a provider id can only be corrected locally.
            return self.correct_locally(candidate, now, None).await;
        };

        let Some(_guard) = self.locks.try_acquire(&provider_id) else {
            tracing::debug!(provider_subscription_id = %provider_id, "Subscription busy, skipping");
            return CandidateOutcome::SkippedLocked;
        };

        // Reload under the lock: a webhook may have fixed it already.
        let current = match self.repository.get_current(&practitioner_id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => return CandidateOutcome::Unchanged,
            Err(err) => {
                tracing::warn!(provider_subscription_id = %provider_id, error = %err, "Reload failed");
                return CandidateOutcome::Failed { corrected: false };
            }
        };
        if current.provider_subscription_id.as_deref() != Some(provider_id.as_str())
            || !current.needs_reconciliation(now)
        {
            return CandidateOutcome::Unchanged;
        }

        let fetched = tokio::time::timeout(
            self.settings.provider_timeout,
            self.payment_provider.get_subscription(&provider_id),
        )
        .await;

        let remote = match fetched {
            Ok(Ok(remote)) => remote,
            Ok(Err(err)) => {
                tracing::warn!(provider_subscription_id = %provider_id, error = %err, "Provider lookup failed");
                return self.correct_locally(current, now, Some(&provider_id)).await;
            }
            Err(_) => {
                tracing::warn!(provider_subscription_id = %provider_id, "Provider lookup timed out");
                return self.correct_locally(current, now, Some(&provider_id)).await;
            }
        };

        let before = current.clone();
        let mut updated = current;
        let changed = match remote {
            Some(remote) => {
                let snapshot = self.snapshot(&remote);
                updated.apply_provider_snapshot(&snapshot, now, self.settings.grace_period)
            }
            None => {
                tracing::info!(provider_subscription_id = %provider_id, "Provider no longer knows subscription");
                updated.end_to_free(now).map(|_| true)
            }
        };

        match changed {
            Ok(true) => match self.save(&before, updated, now).await {
                Saved::Written => CandidateOutcome::Corrected,
                Saved::Moved => CandidateOutcome::SkippedLocked,
                Saved::Failed => CandidateOutcome::Failed { corrected: false },
            },
            Ok(false) => CandidateOutcome::Unchanged,
            Err(err) => {
                tracing::warn!(provider_subscription_id = %provider_id, error = %err, "Provider state not applicable");
                CandidateOutcome::Failed { corrected: false }
            }
        }
    }

    /// Applies local expiry rules and counts the pass as failed when the
    /// provider was consulted and unreachable.
    async fn correct_locally(
        &self,
        current: Subscription,
        now: Timestamp,
        provider_id: Option<&str>,
    ) -> CandidateOutcome {
        let before = current.clone();
        let mut updated = current;
        let corrected = match updated.apply_local_expiry(now) {
            Ok(true) => match self.save(&before, updated, now).await {
                Saved::Written => true,
                Saved::Moved => return CandidateOutcome::SkippedLocked,
                Saved::Failed => false,
            },
            Ok(false) => false,
            Err(err) => {
                tracing::warn!(practitioner_id = %before.practitioner_id, error = %err, "Local expiry failed");
                false
            }
        };
        match provider_id {
            Some(_) => CandidateOutcome::Failed { corrected },
            None if corrected => CandidateOutcome::Corrected,
            None => CandidateOutcome::Unchanged,
        }
    }

    fn snapshot(&self, remote: &ProviderSubscription) -> ProviderSnapshot {
        let period = match (remote.current_period_start, remote.current_period_end) {
            (Some(start), Some(end)) => Timestamp::from_unix_secs(start)
                .zip(Timestamp::from_unix_secs(end))
                .and_then(|(start, end)| BillingPeriod::new(start, end).ok()),
            _ => None,
        };
        ProviderSnapshot {
            status: remote.status,
            period,
            plan: remote
                .price_id
                .as_deref()
                .and_then(|price| self.catalog.resolve_price(price)),
            cancel_at_period_end: remote.cancel_at_period_end,
        }
    }

    /// Persists a corrected subscription, unless the row moved on since
    /// `before` was read, and publishes the change.
    async fn save(&self, before: &Subscription, mut updated: Subscription, now: Timestamp) -> Saved {
        // Corrections count as observations, so older webhooks still in
        // flight are treated as stale.
        if updated.last_applied_event_at.map_or(true, |at| at < now) {
            updated.last_applied_event_at = Some(now);
        }

        match self
            .repository
            .upsert_if_unchanged(&updated, &RowVersion::of(Some(before)))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(practitioner_id = %updated.practitioner_id, "Subscription changed during reconciliation, skipping");
                return Saved::Moved;
            }
            Err(err) => {
                tracing::error!(practitioner_id = %updated.practitioner_id, error = %err, "Failed to save reconciled subscription");
                return Saved::Failed;
            }
        }

        tracing::info!(
            practitioner_id = %updated.practitioner_id,
            from_status = before.status.as_str(),
            status = updated.status.as_str(),
            from_tier = %before.tier,
            tier = %updated.tier,
            "Subscription reconciled"
        );

        if let Some(change) =
            SubscriptionChanged::between(Some(before), &updated, ChangeSource::Reconciliation, None)
        {
            if let Err(err) = self.publisher.publish(change).await {
                tracing::warn!(error = %err, "Failed to publish subscription change");
            }
        }
        Saved::Written
    }

    async fn prune_ledger(&self, now: Timestamp) {
        let cutoff = Timestamp::from_datetime(*now.as_datetime() - self.settings.ledger_retention);
        match self.ledger.prune_before(cutoff).await {
            Ok(0) => {}
            Ok(pruned) => tracing::info!(pruned, "Pruned billing event ledger"),
            Err(err) => tracing::warn!(error = %err, "Ledger pruning failed"),
        }
    }
}

/// Runs the job on its interval until `shutdown` flips to true.
pub fn spawn(job: Arc<ReconciliationJob>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let interval = job.settings.interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = job.run_once().await {
                        tracing::warn!(error = %err, "Reconciliation pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Reconciliation job stopping");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::events::InMemoryEventBus;
    use crate::adapters::memory::InMemorySubscriptionStore;
    use crate::adapters::stripe::MockPaymentProvider;
    use crate::domain::billing::{
        test_catalog, Activation, BillingCycle, BillingEvent, EventOutcome, ProviderStatus,
        SubscriptionStatus, TierId,
    };
    use crate::domain::foundation::PractitionerId;
    use crate::ports::{
        CheckoutSession, CreateCheckoutRequest, CreateCustomerRequest, Customer, PaymentError,
        PaymentProvider,
    };

    const JAN_1: i64 = 1_735_689_600;
    const FEB_1: i64 = 1_738_368_000;
    const MAR_1: i64 = 1_740_787_200;
    const DAY: i64 = 86_400;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_unix_secs(secs).unwrap()
    }

    fn practitioner() -> PractitionerId {
        PractitionerId::new("prac-1").unwrap()
    }

    struct Fixture {
        store: Arc<InMemorySubscriptionStore>,
        provider: MockPaymentProvider,
        bus: Arc<InMemoryEventBus>,
        locks: Arc<SubscriptionLocks>,
        job: ReconciliationJob,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let provider = MockPaymentProvider::new();
        let bus = Arc::new(InMemoryEventBus::new());
        let locks = Arc::new(SubscriptionLocks::new());
        let job = ReconciliationJob::new(
            store.clone(),
            store.clone(),
            Arc::new(provider.clone()),
            bus.clone(),
            Arc::new(test_catalog()),
            locks.clone(),
            ReconcileSettings {
                provider_timeout: Duration::from_millis(50),
                ..ReconcileSettings::default()
            },
        );
        Fixture {
            store,
            provider,
            bus,
            locks,
            job,
        }
    }

    async fn seed_active(store: &InMemorySubscriptionStore, tier: TierId) -> Subscription {
        let mut sub = Subscription::new(practitioner(), ts(JAN_1));
        sub.activate(
            Activation {
                tier,
                cycle: BillingCycle::Monthly,
                period: BillingPeriod::starting_at(ts(JAN_1), BillingCycle::Monthly),
                provider_customer_id: "cus_1".to_string(),
                provider_subscription_id: "sub_1".to_string(),
            },
            ts(JAN_1),
        )
        .unwrap();
        store.upsert(&sub).await.unwrap();
        sub
    }

    fn remote(status: ProviderStatus, start: i64, end: i64, price: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status,
            current_period_start: Some(start),
            current_period_end: Some(end),
            cancel_at_period_end: false,
            price_id: Some(price.to_string()),
        }
    }

    async fn current(store: &InMemorySubscriptionStore) -> Subscription {
        store.get_current(&practitioner()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn renewed_at_provider_advances_period() {
        let f = fixture();
        seed_active(&f.store, TierId::Professional).await;
        f.provider
            .add_subscription(remote(ProviderStatus::Active, FEB_1, MAR_1, "price_pro_m"));

        let report = f.job.run_at(ts(FEB_1 + DAY)).await.unwrap().unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.corrected, 1);
        let sub = current(&f.store).await;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_end, ts(MAR_1));
        assert_eq!(sub.last_applied_event_at, Some(ts(FEB_1 + DAY)));
    }

    #[tokio::test]
    async fn canceled_at_provider_drops_to_free() {
        let f = fixture();
        seed_active(&f.store, TierId::Starter).await;
        f.provider
            .add_subscription(remote(ProviderStatus::Canceled, JAN_1, FEB_1, "price_starter_m"));

        let report = f.job.run_at(ts(FEB_1 + DAY)).await.unwrap().unwrap();

        assert_eq!(report.corrected, 1);
        let sub = current(&f.store).await;
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert_eq!(sub.tier, TierId::Free);
        assert_eq!(f.bus.event_count(), 1);
    }

    #[tokio::test]
    async fn missing_at_provider_drops_to_free() {
        let f = fixture();
        seed_active(&f.store, TierId::Starter).await;

        f.job.run_at(ts(FEB_1 + DAY)).await.unwrap().unwrap();

        assert_eq!(current(&f.store).await.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn elapsed_cancel_at_period_end_drops_to_free() {
        let f = fixture();
        let mut sub = seed_active(&f.store, TierId::Professional).await;
        sub.cancel(true, ts(JAN_1 + DAY)).unwrap();
        f.store.upsert(&sub).await.unwrap();
        let mut provider_view = remote(ProviderStatus::Active, JAN_1, FEB_1, "price_pro_m");
        provider_view.cancel_at_period_end = true;
        f.provider.add_subscription(provider_view);

        f.job.run_at(ts(FEB_1 + 60)).await.unwrap().unwrap();

        let sub = current(&f.store).await;
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert_eq!(sub.tier, TierId::Free);
    }

    #[tokio::test]
    async fn provider_failure_applies_elapsed_grace_locally() {
        let f = fixture();
        let mut sub = seed_active(&f.store, TierId::Professional).await;
        sub.mark_payment_failed(ts(JAN_1 + DAY), chrono::Duration::days(7), ts(JAN_1 + DAY))
            .unwrap();
        f.store.upsert(&sub).await.unwrap();
        f.provider
            .set_method_error("get_subscription", PaymentError::network("connection reset"));

        let report = f.job.run_at(ts(JAN_1 + 9 * DAY)).await.unwrap().unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.corrected, 1);
        let sub = current(&f.store).await;
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert_eq!(sub.tier, TierId::Free);
    }

    #[tokio::test]
    async fn provider_failure_without_local_rule_leaves_state() {
        let f = fixture();
        let seeded = seed_active(&f.store, TierId::Professional).await;
        f.provider
            .set_method_error("get_subscription", PaymentError::provider("502"));

        let report = f.job.run_at(ts(FEB_1 + DAY)).await.unwrap().unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.corrected, 0);
        assert_eq!(current(&f.store).await, seeded);
    }

    #[tokio::test]
    async fn provider_timeout_counts_as_failure() {
        let f = fixture();
        seed_active(&f.store, TierId::Professional).await;
        f.provider.set_delay(Duration::from_millis(500));

        let report = f.job.run_at(ts(FEB_1 + DAY)).await.unwrap().unwrap();

        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn subscription_locked_by_webhook_is_skipped() {
        let f = fixture();
        let seeded = seed_active(&f.store, TierId::Professional).await;
        let _webhook = f.locks.acquire("sub_1").await;

        let report = f.job.run_at(ts(FEB_1 + DAY)).await.unwrap().unwrap();

        assert_eq!(report.skipped_locked, 1);
        assert!(!f.provider.was_called("get_subscription"));
        assert_eq!(current(&f.store).await, seeded);
    }

    #[tokio::test]
    async fn overlapping_pass_is_skipped() {
        let f = fixture();
        let _running = f.job.running.lock().await;

        let report = f.job.run_at(ts(FEB_1)).await.unwrap();

        assert!(report.is_none());
    }

    #[tokio::test]
    async fn current_subscriptions_are_not_examined() {
        let f = fixture();
        seed_active(&f.store, TierId::Professional).await;

        let report = f.job.run_at(ts(JAN_1 + DAY)).await.unwrap().unwrap();

        assert_eq!(report, ReconcileReport::default());
        assert!(!f.provider.was_called("get_subscription"));
    }

    #[tokio::test]
    async fn prunes_old_ledger_rows() {
        let f = fixture();
        let old = BillingEvent::new("evt_old", "invoice.paid", ts(JAN_1), ts(JAN_1), EventOutcome::Applied);
        let recent = BillingEvent::new(
            "evt_new",
            "invoice.paid",
            ts(MAR_1),
            ts(MAR_1),
            EventOutcome::Applied,
        );
        f.store.commit_event(&old, None).await.unwrap();
        f.store.commit_event(&recent, None).await.unwrap();

        f.job.run_at(ts(MAR_1 + 60 * DAY)).await.unwrap().unwrap();

        assert_eq!(f.store.event_count(), 1);
        assert!(f.store.find_by_event_id("evt_new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn provider_agreeing_with_local_state_writes_nothing() {
        let f = fixture();
        let seeded = seed_active(&f.store, TierId::Starter).await;
        f.provider
            .add_subscription(remote(ProviderStatus::Active, JAN_1, FEB_1, "price_starter_m"));

        for hour in 1..=3 {
            let report = f.job.run_at(ts(FEB_1 + hour * 3600)).await.unwrap().unwrap();

            assert_eq!(report.examined, 1);
            assert_eq!(report.corrected, 0);
            let sub = current(&f.store).await;
            assert_eq!(sub, seeded);
            assert_eq!(sub.last_applied_event_at, None);
        }
        assert_eq!(f.bus.event_count(), 0);
    }

    /// Lets a webhook rewrite the row while the provider call is in flight.
    struct RacingProvider {
        inner: MockPaymentProvider,
        store: Arc<InMemorySubscriptionStore>,
        replacement: std::sync::Mutex<Option<Subscription>>,
    }

    #[async_trait::async_trait]
    impl PaymentProvider for RacingProvider {
        async fn find_customer(
            &self,
            practitioner_id: &PractitionerId,
        ) -> Result<Option<Customer>, PaymentError> {
            self.inner.find_customer(practitioner_id).await
        }

        async fn create_customer(
            &self,
            request: CreateCustomerRequest,
        ) -> Result<Customer, PaymentError> {
            self.inner.create_customer(request).await
        }

        async fn create_checkout_session(
            &self,
            request: CreateCheckoutRequest,
        ) -> Result<CheckoutSession, PaymentError> {
            self.inner.create_checkout_session(request).await
        }

        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<Option<ProviderSubscription>, PaymentError> {
            let replacement = self.replacement.lock().unwrap().take();
            if let Some(replacement) = replacement {
                self.store.upsert(&replacement).await.unwrap();
            }
            self.inner.get_subscription(subscription_id).await
        }
    }

    #[tokio::test]
    async fn row_rewritten_during_provider_call_is_left_for_next_pass() {
        let f = fixture();
        let seeded = seed_active(&f.store, TierId::Starter).await;
        f.provider
            .add_subscription(remote(ProviderStatus::Canceled, JAN_1, FEB_1, "price_starter_m"));

        let mut replacement = seeded.clone();
        replacement
            .activate(
                Activation {
                    tier: TierId::Elite,
                    cycle: BillingCycle::Monthly,
                    period: BillingPeriod::starting_at(ts(FEB_1), BillingCycle::Monthly),
                    provider_customer_id: "cus_1".to_string(),
                    provider_subscription_id: "sub_2".to_string(),
                },
                ts(FEB_1 + 60),
            )
            .unwrap();
        replacement.record_applied("evt_x", ts(FEB_1 + 60)).unwrap();

        let job = ReconciliationJob::new(
            f.store.clone(),
            f.store.clone(),
            Arc::new(RacingProvider {
                inner: f.provider.clone(),
                store: f.store.clone(),
                replacement: std::sync::Mutex::new(Some(replacement.clone())),
            }),
            f.bus.clone(),
            Arc::new(test_catalog()),
            f.locks.clone(),
            ReconcileSettings::default(),
        );

        let report = job.run_at(ts(FEB_1 + DAY)).await.unwrap().unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.corrected, 0);
        assert_eq!(report.skipped_locked, 1);
        assert_eq!(current(&f.store).await, replacement);
        assert_eq!(f.bus.event_count(), 0);
    }
}
