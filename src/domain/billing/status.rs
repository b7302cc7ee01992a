//! Subscription status state machine.
//!
//! | From | To | Trigger |
//! |------|----|---------|
//! | NONE | ACTIVE | checkout completed |
//! | ACTIVE | PAST_DUE | payment failed |
//! | PAST_DUE | ACTIVE | payment recovered |
//! | PAST_DUE | CANCELED | grace elapsed or explicit cancel |
//! | ACTIVE | CANCELED | explicit cancel |
//! | CANCELED | ACTIVE | fresh checkout (reactivation) |

use crate::domain::foundation::StateMachine;
use serde::{Deserialize, Serialize};

/// Billing status of a practitioner's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Never subscribed.
    #[default]
    None,

    /// Paid and within the current period.
    Active,

    /// Last payment failed. Entitlements continue until the grace deadline.
    PastDue,

    /// Ended. Only a fresh checkout reactivates it.
    Canceled,
}

impl SubscriptionStatus {
    /// True for states that may carry a paid entitlement.
    ///
    /// PAST_DUE still needs its grace deadline checked by the caller.
    pub fn has_entitlement(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::PastDue)
    }

    /// Stable lowercase form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Parses the storage form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SubscriptionStatus::None),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl StateMachine for SubscriptionStatus {
    fn can_transition_to(&self, target: &Self) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, target),
            (None, Active)
                | (Active, PastDue)
                | (Active, Canceled)
                | (PastDue, Active)
                | (PastDue, Canceled)
                | (Canceled, Active)
        )
    }

    fn valid_transitions(&self) -> Vec<Self> {
        use SubscriptionStatus::*;
        match self {
            None => vec![Active],
            Active => vec![PastDue, Canceled],
            PastDue => vec![Active, Canceled],
            Canceled => vec![Active],
        }
    }
}
