//! Processed-event ledger entries.
//!
//! Every provider event that passes signature verification and carries a
//! readable id leaves exactly one ledger row. The row's presence is what
//! makes redelivery a no-op.

use serde::{Deserialize, Serialize};

use crate::domain::foundation::Timestamp;

/// What processing did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// State was changed (or confirmed) by this event.
    Applied,
    /// Older than the subscription's last applied event.
    Stale,
    /// Event type carries nothing we act on.
    Ignored,
    /// Signed correctly but the payload could not be interpreted.
    Malformed,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Stale => "stale",
            EventOutcome::Ignored => "ignored",
            EventOutcome::Malformed => "malformed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(EventOutcome::Applied),
            "stale" => Some(EventOutcome::Stale),
            "ignored" => Some(EventOutcome::Ignored),
            "malformed" => Some(EventOutcome::Malformed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row, keyed by the provider's event id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub provider_event_id: String,
    pub event_type: String,
    /// Provider-side creation time of the event.
    pub occurred_at: Timestamp,
    pub processed_at: Timestamp,
    pub outcome: EventOutcome,
    pub provider_subscription_id: Option<String>,
}

impl BillingEvent {
    pub fn new(
        provider_event_id: impl Into<String>,
        event_type: impl Into<String>,
        occurred_at: Timestamp,
        processed_at: Timestamp,
        outcome: EventOutcome,
    ) -> Self {
        Self {
            provider_event_id: provider_event_id.into(),
            event_type: event_type.into(),
            occurred_at,
            processed_at,
            outcome,
            provider_subscription_id: None,
        }
    }

    pub fn for_subscription(mut self, provider_subscription_id: impl Into<String>) -> Self {
        self.provider_subscription_id = Some(provider_subscription_id.into());
        self
    }
}
