//! Subscription aggregate.
//!
//! One record per practitioner, created by the first applied checkout
//! completion and never deleted. Cancellation is a status, not a removal.
//!
//! # Invariants
//!
//! - Status changes go through [`SubscriptionStatus`]'s state machine.
//! - `last_applied_event_at` never decreases.
//! - `current_period_start < current_period_end` once ACTIVE.
//! - Upgrades apply immediately. Downgrades wait in `pending_tier` until a
//!   period starting at or after the current period end is applied.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::provider_event::ProviderStatus;
use super::status::SubscriptionStatus;
use super::tier::{BillingCycle, TierId};
use crate::domain::foundation::{
    DomainError, ErrorCode, PractitionerId, StateMachine, SubscriptionId, Timestamp,
    ValidationError,
};

/// Half-open billing interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl BillingPeriod {
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::invalid_format(
                "billing_period",
                format!("period end {} is not after start {}", end, start),
            ));
        }
        Ok(Self { start, end })
    }

    /// One full cycle beginning at `start`.
    pub fn starting_at(start: Timestamp, cycle: BillingCycle) -> Self {
        Self {
            start,
            end: cycle.advance(start),
        }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.start <= at && at < self.end
    }
}

/// Everything a checkout completion sets on the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub tier: TierId,
    pub cycle: BillingCycle,
    pub period: BillingPeriod,
    pub provider_customer_id: String,
    pub provider_subscription_id: String,
}

/// Changes carried by a renewal or subscription update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodRefresh {
    pub period: Option<BillingPeriod>,
    /// Tier and cycle resolved from the provider price, if present.
    pub plan: Option<(TierId, BillingCycle)>,
    pub cancel_at_period_end: Option<bool>,
    /// Whether the event proves payment is current (PAST_DUE → ACTIVE).
    pub payment_current: bool,
}

/// What a refresh did to the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierChange {
    Unchanged,
    Upgraded(TierId),
    DowngradeScheduled(TierId),
    Downgraded(TierId),
    /// The subscription is not billing (NONE or CANCELED); nothing applied.
    NotBilling,
}

/// Provider-side truth fetched by the reconciliation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSnapshot {
    pub status: ProviderStatus,
    pub period: Option<BillingPeriod>,
    pub plan: Option<(TierId, BillingCycle)>,
    pub cancel_at_period_end: bool,
}

/// A practitioner's membership subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub practitioner_id: PractitionerId,
    pub tier: TierId,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub current_period_start: Timestamp,
    pub current_period_end: Timestamp,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub last_applied_event_id: Option<String>,
    pub last_applied_event_at: Option<Timestamp>,
    /// Downgrade waiting for the current period to end.
    pub pending_tier: Option<TierId>,
    pub cancel_at_period_end: bool,
    /// Set on entering PAST_DUE. Entitlements lapse after this instant.
    pub grace_ends_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Subscription {
    /// A practitioner with no billing history (status NONE, free tier).
    pub fn new(practitioner_id: PractitionerId, now: Timestamp) -> Self {
        Self {
            id: SubscriptionId::new(),
            practitioner_id,
            tier: TierId::Free,
            status: SubscriptionStatus::None,
            billing_cycle: BillingCycle::Monthly,
            current_period_start: now,
            current_period_end: now,
            provider_customer_id: None,
            provider_subscription_id: None,
            last_applied_event_id: None,
            last_applied_event_at: None,
            pending_tier: None,
            cancel_at_period_end: false,
            grace_ends_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    // ─── Event ordering ─────────────────────────────────────────────

    /// True if an event that occurred at `occurred_at` predates the last
    /// applied one. Equal timestamps are not stale.
    pub fn is_stale(&self, occurred_at: Timestamp) -> bool {
        self.last_applied_event_at
            .map(|last| occurred_at < last)
            .unwrap_or(false)
    }

    /// Advances the applied-event watermark.
    ///
    /// # Errors
    ///
    /// `StaleEvent` if `occurred_at` is older than the current watermark.
    pub fn record_applied(
        &mut self,
        event_id: impl Into<String>,
        occurred_at: Timestamp,
    ) -> Result<(), DomainError> {
        if self.is_stale(occurred_at) {
            return Err(DomainError::new(
                ErrorCode::StaleEvent,
                format!(
                    "event at {} is older than last applied event at {}",
                    occurred_at,
                    self.last_applied_event_at
                        .map(|t| t.to_string())
                        .unwrap_or_default()
                ),
            ));
        }
        self.last_applied_event_id = Some(event_id.into());
        self.last_applied_event_at = Some(occurred_at);
        Ok(())
    }

    // ─── Transitions driven by provider events ──────────────────────

    /// Applies a completed checkout. Activates NONE, reactivates CANCELED,
    /// and replaces plan and ids on an already billing subscription.
    pub fn activate(&mut self, activation: Activation, now: Timestamp) -> Result<(), DomainError> {
        if self.status != SubscriptionStatus::Active {
            self.transition_to(SubscriptionStatus::Active)?;
        }
        self.tier = activation.tier;
        self.billing_cycle = activation.cycle;
        self.current_period_start = activation.period.start;
        self.current_period_end = activation.period.end;
        self.provider_customer_id = Some(activation.provider_customer_id);
        self.provider_subscription_id = Some(activation.provider_subscription_id);
        self.pending_tier = None;
        self.cancel_at_period_end = false;
        self.grace_ends_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Applies a renewal or subscription update.
    pub fn refresh(
        &mut self,
        refresh: PeriodRefresh,
        now: Timestamp,
    ) -> Result<TierChange, DomainError> {
        if !self.status.has_entitlement() {
            return Ok(TierChange::NotBilling);
        }

        let previous_end = self.current_period_end;
        let mut rolled_over = false;
        if let Some(period) = refresh.period {
            if period.end >= self.current_period_end {
                rolled_over = period.start >= previous_end;
                self.current_period_start = period.start;
                self.current_period_end = period.end;
            }
        }

        let mut change = TierChange::Unchanged;
        if rolled_over {
            if let Some(pending) = self.pending_tier.take() {
                self.tier = pending;
                change = TierChange::Downgraded(pending);
            }
        }

        if let Some((tier, cycle)) = refresh.plan {
            if tier == self.tier {
                self.billing_cycle = cycle;
                self.pending_tier = None;
            } else if self.tier.is_upgrade_to(tier) {
                self.tier = tier;
                self.billing_cycle = cycle;
                self.pending_tier = None;
                change = TierChange::Upgraded(tier);
            } else if rolled_over {
                self.tier = tier;
                self.billing_cycle = cycle;
                change = TierChange::Downgraded(tier);
            } else {
                self.pending_tier = Some(tier);
                change = TierChange::DowngradeScheduled(tier);
            }
        }

        if let Some(flag) = refresh.cancel_at_period_end {
            self.cancel_at_period_end = flag;
        }

        if refresh.payment_current && self.status == SubscriptionStatus::PastDue {
            self.transition_to(SubscriptionStatus::Active)?;
            self.grace_ends_at = None;
        }

        self.updated_at = now;
        Ok(change)
    }

    /// Records a failed payment. ACTIVE enters PAST_DUE with a grace deadline
    /// counted from `failed_at`; PAST_DUE keeps its original deadline.
    ///
    /// Returns true if the status changed.
    pub fn mark_payment_failed(
        &mut self,
        failed_at: Timestamp,
        grace: Duration,
        now: Timestamp,
    ) -> Result<bool, DomainError> {
        if self.status != SubscriptionStatus::Active {
            return Ok(false);
        }
        self.transition_to(SubscriptionStatus::PastDue)?;
        self.grace_ends_at = Some(Timestamp::from_datetime(*failed_at.as_datetime() + grace));
        self.updated_at = now;
        Ok(true)
    }

    /// Applies a provider cancellation.
    ///
    /// With `at_period_end` and time left in the period only the flag is
    /// stored; the reconciliation job ends the subscription later.
    pub fn cancel(&mut self, at_period_end: bool, now: Timestamp) -> Result<(), DomainError> {
        if at_period_end && !self.period_elapsed(now) && self.status.has_entitlement() {
            self.cancel_at_period_end = true;
            self.updated_at = now;
            return Ok(());
        }
        self.end_to_free(now)
    }

    /// CANCELED on the free tier. No-op for NONE and CANCELED.
    pub fn end_to_free(&mut self, now: Timestamp) -> Result<(), DomainError> {
        if !self.status.has_entitlement() {
            return Ok(());
        }
        self.transition_to(SubscriptionStatus::Canceled)?;
        self.tier = TierId::Free;
        self.pending_tier = None;
        self.cancel_at_period_end = false;
        self.grace_ends_at = None;
        self.updated_at = now;
        Ok(())
    }

    // ─── Reconciliation ─────────────────────────────────────────────

    pub fn period_elapsed(&self, as_of: Timestamp) -> bool {
        self.current_period_end <= as_of
    }

    pub fn grace_expired(&self, as_of: Timestamp) -> bool {
        self.status == SubscriptionStatus::PastDue
            && self.grace_ends_at.map(|end| end <= as_of).unwrap_or(false)
    }

    /// Billing subscription whose period lapsed or whose grace ran out.
    pub fn needs_reconciliation(&self, as_of: Timestamp) -> bool {
        self.status.has_entitlement() && (self.period_elapsed(as_of) || self.grace_expired(as_of))
    }

    /// Rules decidable without the provider: elapsed grace and elapsed
    /// cancel-at-period-end both end the subscription.
    ///
    /// Returns true if anything changed.
    pub fn apply_local_expiry(&mut self, as_of: Timestamp) -> Result<bool, DomainError> {
        let due = self.grace_expired(as_of) || (self.cancel_at_period_end && self.period_elapsed(as_of));
        if due {
            self.end_to_free(as_of)?;
        }
        Ok(due)
    }

    /// Treats the provider's current state as ground truth.
    ///
    /// Returns true if anything changed.
    pub fn apply_provider_snapshot(
        &mut self,
        snapshot: &ProviderSnapshot,
        as_of: Timestamp,
        grace: Duration,
    ) -> Result<bool, DomainError> {
        let before = self.clone();

        match snapshot.status {
            ProviderStatus::Active | ProviderStatus::Trialing => {
                self.refresh(
                    PeriodRefresh {
                        period: snapshot.period,
                        plan: snapshot.plan,
                        cancel_at_period_end: Some(snapshot.cancel_at_period_end),
                        payment_current: true,
                    },
                    as_of,
                )?;
                self.apply_local_expiry(as_of)?;
            }
            ProviderStatus::PastDue | ProviderStatus::Unpaid => {
                self.refresh(
                    PeriodRefresh {
                        period: snapshot.period,
                        plan: snapshot.plan,
                        cancel_at_period_end: Some(snapshot.cancel_at_period_end),
                        payment_current: false,
                    },
                    as_of,
                )?;
                self.mark_payment_failed(as_of, grace, as_of)?;
                self.apply_local_expiry(as_of)?;
            }
            ProviderStatus::Canceled | ProviderStatus::IncompleteExpired => {
                self.end_to_free(as_of)?;
            }
            ProviderStatus::Incomplete | ProviderStatus::Paused | ProviderStatus::Unknown => {
                self.apply_local_expiry(as_of)?;
            }
        }

        // Transitions stamp `updated_at` even when nothing else moved.
        let touched_at = self.updated_at;
        self.updated_at = before.updated_at;
        let changed = *self != before;
        if changed {
            self.updated_at = touched_at;
        }
        Ok(changed)
    }

    /// Transition to a new status using the state machine.
    fn transition_to(&mut self, target: SubscriptionStatus) -> Result<(), DomainError> {
        self.status = self.status.transition_to(target).map_err(|_| {
            DomainError::new(
                ErrorCode::InvalidStateTransition,
                format!(
                    "Cannot transition subscription from {:?} to {:?}",
                    self.status, target
                ),
            )
        })?;
        Ok(())
    }
}
