//! Notifications emitted after a subscription change is committed.
//!
//! Purely informational. Delivery is best-effort and nothing in billing
//! depends on a notification arriving.

use serde::{Deserialize, Serialize};

use super::status::SubscriptionStatus;
use super::subscription::Subscription;
use super::tier::TierId;
use crate::domain::foundation::{PractitionerId, Timestamp};

/// What caused the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Webhook,
    Reconciliation,
}

/// A subscription's tier or status moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChanged {
    pub practitioner_id: PractitionerId,
    pub provider_subscription_id: Option<String>,
    pub previous_tier: TierId,
    pub tier: TierId,
    pub previous_status: SubscriptionStatus,
    pub status: SubscriptionStatus,
    pub source: ChangeSource,
    /// Provider event id when the change came from a webhook.
    pub event_id: Option<String>,
    pub occurred_at: Timestamp,
}

impl SubscriptionChanged {
    /// Builds a notification if tier or status differ between the two
    /// versions of the subscription.
    pub fn between(
        before: Option<&Subscription>,
        after: &Subscription,
        source: ChangeSource,
        event_id: Option<String>,
    ) -> Option<Self> {
        let (previous_tier, previous_status) = before
            .map(|b| (b.tier, b.status))
            .unwrap_or((TierId::Free, SubscriptionStatus::None));
        if previous_tier == after.tier && previous_status == after.status {
            return None;
        }
        Some(Self {
            practitioner_id: after.practitioner_id.clone(),
            provider_subscription_id: after.provider_subscription_id.clone(),
            previous_tier,
            tier: after.tier,
            previous_status,
            status: after.status,
            source,
            event_id,
            occurred_at: after.updated_at,
        })
    }

    /// Routing key, e.g. `subscription.changed`.
    pub fn event_type(&self) -> &'static str {
        "subscription.changed"
    }
}
