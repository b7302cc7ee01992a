//! GetSubscriptionHandler - Query handler for a practitioner's subscription view.

use std::sync::Arc;

use serde::Serialize;

use crate::domain::billing::{
    is_entitled, BillingCycle, BillingError, Subscription, SubscriptionStatus, TierId,
};
use crate::domain::foundation::{PractitionerId, Timestamp};
use crate::ports::SubscriptionRepository;

/// Query for the current subscription.
#[derive(Debug, Clone)]
pub struct GetSubscriptionQuery {
    pub practitioner_id: PractitionerId,
}

/// Read model of a subscription.
///
/// A practitioner with no history gets `status: none` on the free tier and
/// no period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionView {
    pub practitioner_id: PractitionerId,
    pub tier: TierId,
    pub status: SubscriptionStatus,
    /// Paid entitlements apply right now.
    pub entitled: bool,
    pub billing_cycle: Option<BillingCycle>,
    pub current_period_start: Option<Timestamp>,
    pub current_period_end: Option<Timestamp>,
    /// Downgrade taking effect at the next period.
    pub pending_tier: Option<TierId>,
    pub cancel_at_period_end: bool,
    pub grace_ends_at: Option<Timestamp>,
}

impl SubscriptionView {
    pub fn from_subscription(sub: &Subscription, as_of: Timestamp) -> Self {
        let billed = sub.status != SubscriptionStatus::None;
        Self {
            practitioner_id: sub.practitioner_id.clone(),
            tier: sub.tier,
            status: sub.status,
            entitled: is_entitled(sub, as_of),
            billing_cycle: billed.then_some(sub.billing_cycle),
            current_period_start: billed.then_some(sub.current_period_start),
            current_period_end: billed.then_some(sub.current_period_end),
            pending_tier: sub.pending_tier,
            cancel_at_period_end: sub.cancel_at_period_end,
            grace_ends_at: sub.grace_ends_at,
        }
    }

    pub fn none(practitioner_id: PractitionerId) -> Self {
        Self {
            practitioner_id,
            tier: TierId::Free,
            status: SubscriptionStatus::None,
            entitled: false,
            billing_cycle: None,
            current_period_start: None,
            current_period_end: None,
            pending_tier: None,
            cancel_at_period_end: false,
            grace_ends_at: None,
        }
    }
}

pub struct GetSubscriptionHandler {
    repository: Arc<dyn SubscriptionRepository>,
}

impl GetSubscriptionHandler {
    pub fn new(repository: Arc<dyn SubscriptionRepository>) -> Self {
        Self { repository }
    }

    pub async fn handle(&self, query: GetSubscriptionQuery) -> Result<SubscriptionView, BillingError> {
        let now = Timestamp::now();
        let view = match self.repository.get_current(&query.practitioner_id).await? {
            Some(sub) => SubscriptionView::from_subscription(&sub, now),
            None => SubscriptionView::none(query.practitioner_id),
        };
        Ok(view)
    }
}
