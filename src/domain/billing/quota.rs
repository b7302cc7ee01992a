//! Lead quota windows and arithmetic.
//!
//! Usage is never stored. The window is derived from the subscription at
//! query time and the caller counts leads inside it.

use serde::Serialize;

use super::catalog::{LeadQuota, TierCatalog};
use super::errors::BillingError;
use super::status::SubscriptionStatus;
use super::subscription::Subscription;
use super::tier::{BillingCycle, TierId};
use crate::domain::foundation::Timestamp;

/// Upper bound on cycles projected past a lapsed period end.
const MAX_PROJECTED_CYCLES: u32 = 120;

/// Half-open window `[start, end)` and the lead allowance inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    pub tier: TierId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub quota: LeadQuota,
}

impl QuotaWindow {
    /// Window for `subscription` as of `as_of`.
    ///
    /// An entitled subscription uses its billing period, projected forward by
    /// whole cycles if the renewal has not been applied yet. Anything else
    /// falls back to the calendar month and the free tier's allowance.
    pub fn resolve(
        subscription: Option<&Subscription>,
        catalog: &TierCatalog,
        as_of: Timestamp,
    ) -> Result<Self, BillingError> {
        if let Some(sub) = subscription.filter(|s| is_entitled(s, as_of)) {
            let config = catalog.lookup(sub.tier)?;
            let (start, end) = project_period(
                sub.current_period_start,
                sub.current_period_end,
                sub.billing_cycle,
                as_of,
            );
            return Ok(Self {
                tier: sub.tier,
                start,
                end,
                quota: config.lead_quota,
            });
        }

        let free = catalog.free_tier()?;
        Ok(Self {
            tier: free.id,
            start: as_of.start_of_month(),
            end: as_of.start_of_next_month(),
            quota: free.lead_quota,
        })
    }
}

/// ACTIVE, or PAST_DUE before its grace deadline. A cancel-at-period-end
/// subscription stops being entitled once its period is over.
pub fn is_entitled(sub: &Subscription, as_of: Timestamp) -> bool {
    let scheduled_end_passed = sub.cancel_at_period_end && sub.period_elapsed(as_of);
    let status_ok = match sub.status {
        SubscriptionStatus::Active => true,
        SubscriptionStatus::PastDue => !sub.grace_expired(as_of),
        SubscriptionStatus::None | SubscriptionStatus::Canceled => false,
    };
    status_ok && !scheduled_end_passed
}

fn project_period(
    mut start: Timestamp,
    mut end: Timestamp,
    cycle: BillingCycle,
    as_of: Timestamp,
) -> (Timestamp, Timestamp) {
    let mut steps = 0;
    while end <= as_of && steps < MAX_PROJECTED_CYCLES {
        start = end;
        end = cycle.advance(start);
        steps += 1;
    }
    (start, end)
}

/// `max(limit - used, 0)`, or `None` when unlimited.
pub fn remaining(quota: LeadQuota, used: u64) -> Option<u64> {
    quota
        .cap()
        .map(|limit| u64::from(limit).saturating_sub(used))
}

/// Usage snapshot for one practitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub tier: TierId,
    pub used: u64,
    /// `None` when unlimited.
    pub limit: Option<u32>,
    /// `None` when unlimited.
    pub remaining: Option<u64>,
    pub unlimited: bool,
    pub period_start: Timestamp,
    pub period_end: Timestamp,
}

impl QuotaUsage {
    pub fn new(window: &QuotaWindow, used: u64) -> Self {
        Self {
            tier: window.tier,
            used,
            limit: window.quota.cap(),
            remaining: remaining(window.quota, used),
            unlimited: window.quota.is_unlimited(),
            period_start: window.start,
            period_end: window.end,
        }
    }

    /// True if one more lead fits in the window.
    pub fn can_consume(&self) -> bool {
        match self.limit {
            None => true,
            Some(limit) => self.used < u64::from(limit),
        }
    }

    /// `QuotaExceeded` when no capacity is left.
    pub fn require_capacity(&self) -> Result<(), BillingError> {
        if self.can_consume() {
            return Ok(());
        }
        Err(BillingError::QuotaExceeded {
            used: self.used,
            limit: self.limit.unwrap_or_default(),
        })
    }
}
