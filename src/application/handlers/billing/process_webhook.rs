//! ProcessWebhookHandler - Applies verified Stripe events to subscriptions.
//!
//! Delivery is at-least-once and unordered. Two guards make processing safe:
//!
//! - **Ledger**: every processed event id is recorded in the same
//!   transaction as the state write, so a redelivery is a no-op.
//! - **Watermark**: an event strictly older than the subscription's last
//!   applied event is recorded as stale and not applied.
//!
//! Events for one subscription are serialized through [`SubscriptionLocks`].
//! The state write is additionally conditional on the row version that was
//! read, since the row is keyed by practitioner and a checkout for a new
//! subscription id can land on the same row from another lock scope.

use std::sync::Arc;

use serde::Serialize;

use crate::application::SubscriptionLocks;
use crate::domain::billing::{
    interpret, Activation, BillingChange, BillingEvent, BillingPeriod, ChangeSource,
    EventOutcome, PeriodRefresh, StripeEvent, StripeWebhookVerifier, Subscription,
    SubscriptionChanged, TierCatalog, TierChange, WebhookError,
};
use crate::domain::foundation::{DomainError, Timestamp};
use crate::ports::{
    BillingEventLedger, EventPublisher, LedgerInsert, RowVersion, SubscriptionRepository,
    SubscriptionWrite,
};

/// Raw webhook delivery.
#[derive(Debug, Clone)]
pub struct ProcessWebhookCommand {
    pub payload: Vec<u8>,
    /// `Stripe-Signature` header value.
    pub signature: String,
}

/// How a delivery was acknowledged. Every variant means HTTP 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    Duplicate,
    Stale,
    Ignored,
    Malformed,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Stale => "stale",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Malformed => "malformed",
        }
    }
}

impl From<EventOutcome> for WebhookOutcome {
    fn from(outcome: EventOutcome) -> Self {
        match outcome {
            EventOutcome::Applied => WebhookOutcome::Applied,
            EventOutcome::Stale => WebhookOutcome::Stale,
            EventOutcome::Ignored => WebhookOutcome::Ignored,
            EventOutcome::Malformed => WebhookOutcome::Malformed,
        }
    }
}

/// Processing knobs.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Grace period granted when a payment fails.
    pub grace_period: chrono::Duration,
    /// Acknowledge test-mode events without applying them.
    pub require_livemode: bool,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            grace_period: chrono::Duration::days(7),
            require_livemode: false,
        }
    }
}

pub struct ProcessWebhookHandler {
    repository: Arc<dyn SubscriptionRepository>,
    ledger: Arc<dyn BillingEventLedger>,
    publisher: Arc<dyn EventPublisher>,
    catalog: Arc<TierCatalog>,
    locks: Arc<SubscriptionLocks>,
    verifier: Arc<StripeWebhookVerifier>,
    settings: WebhookSettings,
}

impl ProcessWebhookHandler {
    pub fn new(
        repository: Arc<dyn SubscriptionRepository>,
        ledger: Arc<dyn BillingEventLedger>,
        publisher: Arc<dyn EventPublisher>,
        catalog: Arc<TierCatalog>,
        locks: Arc<SubscriptionLocks>,
        verifier: Arc<StripeWebhookVerifier>,
        settings: WebhookSettings,
    ) -> Self {
        Self {
            repository,
            ledger,
            publisher,
            catalog,
            locks,
            verifier,
            settings,
        }
    }

    pub async fn handle(&self, cmd: ProcessWebhookCommand) -> Result<WebhookOutcome, WebhookError> {
        self.handle_at(cmd, Timestamp::now()).await
    }

    /// Processes a delivery as of `now`.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature`, `TimestampOutOfRange`, `InvalidTimestamp` - rejected, never retried
    /// - `SubscriptionNotFound` - non-checkout event arrived first, retried
    /// - `Persistence` - nothing recorded, retried. Includes losing a race
    ///   for the practitioner's row.
    pub async fn handle_at(
        &self,
        cmd: ProcessWebhookCommand,
        now: Timestamp,
    ) -> Result<WebhookOutcome, WebhookError> {
        // 1. Authenticate
        self.verifier.verify_at(&cmd.payload, &cmd.signature, now)?;

        // 2. Parse
        let event: StripeEvent = match serde_json::from_slice(&cmd.payload) {
            Ok(event) => event,
            Err(err) => return self.record_unparseable(&cmd.payload, &err, now).await,
        };
        let occurred_at = match event.occurred_at() {
            Ok(at) => at,
            Err(err) => {
                tracing::warn!(event_id = %event.id, error = %err, "Webhook has unusable timestamp");
                let entry = ledger_entry(&event, now, now, EventOutcome::Malformed);
                return self.record(entry).await;
            }
        };

        if self.settings.require_livemode && !event.livemode {
            tracing::info!(event_id = %event.id, "Ignoring test-mode webhook");
            return self
                .record(ledger_entry(&event, occurred_at, now, EventOutcome::Ignored))
                .await;
        }

        // 3. Fast-path dedup. The commit below is the authoritative check.
        if self
            .ledger
            .find_by_event_id(&event.id)
            .await
            .map_err(persistence)?
            .is_some()
        {
            tracing::debug!(event_id = %event.id, "Duplicate webhook delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        // 4. Interpret
        let change = match interpret(&event, &self.catalog) {
            Ok(change) => change,
            Err(err) if err.is_malformed() => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %err,
                    "Malformed webhook payload"
                );
                return self
                    .record(ledger_entry(&event, occurred_at, now, EventOutcome::Malformed))
                    .await;
            }
            Err(err) => return Err(err),
        };

        let provider_subscription_id = match &change {
            BillingChange::Ignored {
                provider_subscription_id,
                reason,
            } => {
                tracing::debug!(event_id = %event.id, event_type = %event.event_type, reason = %reason, "Webhook ignored");
                let mut entry = ledger_entry(&event, occurred_at, now, EventOutcome::Ignored);
                entry.provider_subscription_id = provider_subscription_id.clone();
                return self.record(entry).await;
            }
            other => match other.provider_subscription_id() {
                Some(id) => id.to_string(),
                None => return Err(WebhookError::MissingField("subscription")),
            },
        };

        // 5. Serialize with other work on this subscription
        let _guard = self.locks.acquire(&provider_subscription_id).await;

        let Some((before, mut subscription)) = self
            .load_subscription(&provider_subscription_id, &change, now)
            .await?
        else {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                provider_subscription_id = %provider_subscription_id,
                "Acknowledging webhook for a replaced subscription"
            );
            let entry = ledger_entry(&event, occurred_at, now, EventOutcome::Ignored)
                .for_subscription(&provider_subscription_id);
            return self.record(entry).await;
        };

        if subscription.is_stale(occurred_at) {
            tracing::info!(
                event_id = %event.id,
                provider_subscription_id = %provider_subscription_id,
                occurred_at = %occurred_at,
                "Discarding stale webhook"
            );
            let entry = ledger_entry(&event, occurred_at, now, EventOutcome::Stale)
                .for_subscription(&provider_subscription_id);
            return self.record(entry).await;
        }

        // 6. Apply
        if let Err(err) = self.apply(&mut subscription, change, occurred_at, now) {
            tracing::warn!(
                event_id = %event.id,
                provider_subscription_id = %provider_subscription_id,
                error = %err,
                "Webhook change rejected by subscription state"
            );
            let entry = ledger_entry(&event, occurred_at, now, EventOutcome::Ignored)
                .for_subscription(&provider_subscription_id);
            return self.record(entry).await;
        }
        subscription
            .record_applied(&event.id, occurred_at)
            .map_err(persistence)?;

        // 7. Ledger row and state in one transaction
        let entry = ledger_entry(&event, occurred_at, now, EventOutcome::Applied)
            .for_subscription(&provider_subscription_id);
        let read = RowVersion::of(before.as_ref());
        match self
            .repository
            .commit_event(&entry, Some(SubscriptionWrite::new(&subscription, &read)))
            .await
        {
            Ok(LedgerInsert::Inserted) => {}
            Ok(LedgerInsert::AlreadyRecorded) => return Ok(WebhookOutcome::Duplicate),
            Ok(LedgerInsert::Conflict) => {
                tracing::warn!(
                    event_id = %event.id,
                    provider_subscription_id = %provider_subscription_id,
                    practitioner_id = %subscription.practitioner_id,
                    "Subscription changed while the webhook was processed"
                );
                return Err(WebhookError::Persistence(
                    "subscription changed concurrently".to_string(),
                ));
            }
            Err(err) => {
                tracing::error!(
                    event_id = %event.id,
                    provider_subscription_id = %provider_subscription_id,
                    error = %err,
                    "Failed to commit webhook"
                );
                return Err(persistence(err));
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            practitioner_id = %subscription.practitioner_id,
            tier = %subscription.tier,
            status = subscription.status.as_str(),
            "Webhook applied"
        );

        self.notify(before.as_ref(), &subscription, &event.id).await;
        Ok(WebhookOutcome::Applied)
    }

    /// Subscription the change targets, plus its state before the change.
    /// `None` if the id was applied before and has since been replaced.
    async fn load_subscription(
        &self,
        provider_subscription_id: &str,
        change: &BillingChange,
        now: Timestamp,
    ) -> Result<Option<(Option<Subscription>, Subscription)>, WebhookError> {
        if let Some(existing) = self
            .repository
            .get_by_subscription_id(provider_subscription_id)
            .await
            .map_err(persistence)?
        {
            return Ok(Some((Some(existing.clone()), existing)));
        }

        match change {
            BillingChange::Checkout(checkout) => {
                match self
                    .repository
                    .get_current(&checkout.practitioner_id)
                    .await
                    .map_err(persistence)?
                {
                    Some(current) => Ok(Some((Some(current.clone()), current))),
                    None => Ok(Some((
                        None,
                        Subscription::new(checkout.practitioner_id.clone(), now),
                    ))),
                }
            }
            _ => {
                if self
                    .ledger
                    .knows_subscription(provider_subscription_id)
                    .await
                    .map_err(persistence)?
                {
                    return Ok(None);
                }
                Err(WebhookError::SubscriptionNotFound(
                    provider_subscription_id.to_string(),
                ))
            }
        }
    }

    fn apply(
        &self,
        subscription: &mut Subscription,
        change: BillingChange,
        occurred_at: Timestamp,
        now: Timestamp,
    ) -> Result<(), DomainError> {
        match change {
            BillingChange::Checkout(checkout) => {
                let period = checkout
                    .period
                    .unwrap_or_else(|| BillingPeriod::starting_at(occurred_at, checkout.cycle));
                subscription.activate(
                    Activation {
                        tier: checkout.tier,
                        cycle: checkout.cycle,
                        period,
                        provider_customer_id: checkout.provider_customer_id,
                        provider_subscription_id: checkout.provider_subscription_id,
                    },
                    now,
                )
            }
            BillingChange::Refresh { refresh, .. } => {
                match subscription.refresh(refresh, now)? {
                    TierChange::Upgraded(tier) => {
                        tracing::info!(practitioner_id = %subscription.practitioner_id, tier = %tier, "Tier upgraded");
                    }
                    TierChange::DowngradeScheduled(tier) => {
                        tracing::info!(practitioner_id = %subscription.practitioner_id, tier = %tier, "Downgrade scheduled for period end");
                    }
                    TierChange::Downgraded(tier) => {
                        tracing::info!(practitioner_id = %subscription.practitioner_id, tier = %tier, "Tier downgraded");
                    }
                    TierChange::Unchanged | TierChange::NotBilling => {}
                }
                Ok(())
            }
            BillingChange::PaymentFailed { period, .. } => {
                subscription.refresh(
                    PeriodRefresh {
                        period,
                        ..PeriodRefresh::default()
                    },
                    now,
                )?;
                if subscription.mark_payment_failed(occurred_at, self.settings.grace_period, now)? {
                    tracing::warn!(
                        practitioner_id = %subscription.practitioner_id,
                        grace_ends_at = ?subscription.grace_ends_at,
                        "Payment failed, subscription past due"
                    );
                }
                Ok(())
            }
            BillingChange::Deleted { at_period_end, .. } => subscription.cancel(at_period_end, now),
            BillingChange::Ignored { .. } => Ok(()),
        }
    }

    /// Ledger-only commit for events that change no state.
    async fn record(&self, entry: BillingEvent) -> Result<WebhookOutcome, WebhookError> {
        let outcome = WebhookOutcome::from(entry.outcome);
        match self.repository.commit_event(&entry, None).await {
            Ok(LedgerInsert::Inserted) => Ok(outcome),
            Ok(LedgerInsert::AlreadyRecorded) => Ok(WebhookOutcome::Duplicate),
            // Ledger-only commits carry no subscription write.
            Ok(LedgerInsert::Conflict) => Ok(outcome),
            Err(err) => {
                tracing::error!(event_id = %entry.provider_event_id, error = %err, "Failed to record webhook");
                Err(persistence(err))
            }
        }
    }

    /// Signed but not a Stripe event. Recorded only if the id is readable.
    async fn record_unparseable(
        &self,
        payload: &[u8],
        err: &serde_json::Error,
        now: Timestamp,
    ) -> Result<WebhookOutcome, WebhookError> {
        let value: Option<serde_json::Value> = serde_json::from_slice(payload).ok();
        let id = value
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_str());
        tracing::warn!(event_id = ?id, error = %err, "Unparseable webhook payload");

        let Some(id) = id else {
            return Ok(WebhookOutcome::Malformed);
        };
        let event_type = value
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let occurred_at = value
            .as_ref()
            .and_then(|v| v.get("created"))
            .and_then(|v| v.as_i64())
            .and_then(Timestamp::from_unix_secs)
            .unwrap_or(now);

        self.record(BillingEvent::new(
            id,
            event_type,
            occurred_at,
            now,
            EventOutcome::Malformed,
        ))
        .await
    }

    async fn notify(&self, before: Option<&Subscription>, after: &Subscription, event_id: &str) {
        let Some(change) = SubscriptionChanged::between(
            before,
            after,
            ChangeSource::Webhook,
            Some(event_id.to_string()),
        ) else {
            return;
        };
        if let Err(err) = self.publisher.publish(change).await {
            tracing::warn!(event_id = %event_id, error = %err, "Failed to publish subscription change");
        }
    }
}

fn ledger_entry(
    event: &StripeEvent,
    occurred_at: Timestamp,
    now: Timestamp,
    outcome: EventOutcome,
) -> BillingEvent {
    BillingEvent::new(&event.id, &event.event_type, occurred_at, now, outcome)
}

fn persistence(err: DomainError) -> WebhookError {
    WebhookError::Persistence(err.to_string())
}
