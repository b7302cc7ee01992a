//! Stripe webhook payloads and their interpretation.
//!
//! Only the fields we act on are captured; everything else in Stripe's
//! schema is ignored. [`interpret`] turns a verified event into a
//! [`BillingChange`] that the webhook handler applies to a subscription.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::catalog::TierCatalog;
use super::subscription::{BillingPeriod, PeriodRefresh};
use super::tier::{BillingCycle, TierId};
use super::webhook_errors::WebhookError;
use crate::domain::foundation::{PractitionerId, Timestamp};

/// Stripe webhook event envelope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeEvent {
    /// Unique identifier for the event (evt_xxx format).
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: String,

    /// Unix seconds.
    pub created: i64,

    pub data: StripeEventData,

    #[serde(default)]
    pub livemode: bool,

    #[serde(default)]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    /// Provider-side creation time.
    pub fn occurred_at(&self) -> Result<Timestamp, WebhookError> {
        Timestamp::from_unix_secs(self.created)
            .ok_or_else(|| WebhookError::ParseError(format!("invalid created time {}", self.created)))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Attempts to deserialize the data object as the specified type.
    pub fn deserialize_object<T: serde::de::DeserializeOwned>(&self) -> Result<T, WebhookError> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| WebhookError::ParseError(e.to_string()))
    }
}

/// Event types we act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    /// `invoice.paid` or `invoice.payment_succeeded`.
    PaymentSucceeded,
    PaymentFailed,
    /// `customer.subscription.updated` or `.created`.
    SubscriptionUpdated,
    SubscriptionDeleted,
    Other,
}

impl EventKind {
    pub fn from_type(s: &str) -> Self {
        match s {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "invoice.paid" | "invoice.payment_succeeded" => Self::PaymentSucceeded,
            "invoice.payment_failed" => Self::PaymentFailed,
            "customer.subscription.updated" | "customer.subscription.created" => {
                Self::SubscriptionUpdated
            }
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            _ => Self::Other,
        }
    }
}

/// Stripe subscription status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Paused,
    #[serde(other)]
    Unknown,
}

impl ProviderStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }

    /// Statuses meaning the latest invoice is paid.
    pub fn is_paid_up(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

// ════════════════════════════════════════════════════════════════════
// Payload objects
// ════════════════════════════════════════════════════════════════════

/// A field Stripe returns either as an id or as the expanded object.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListObject<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PriceRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<Expandable<SubscriptionObject>>,
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionItem {
    pub price: Option<PriceRef>,
    /// Newer API versions carry the period per item.
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: Option<String>,
    #[serde(default = "unknown_status")]
    pub status: ProviderStatus,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub items: Option<ListObject<SubscriptionItem>>,
}

fn unknown_status() -> ProviderStatus {
    ProviderStatus::Unknown
}

impl SubscriptionObject {
    pub fn price_id(&self) -> Option<&str> {
        self.first_item()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.as_str())
    }

    /// Period from the top level, or from the first item.
    pub fn period(&self) -> Result<Option<BillingPeriod>, WebhookError> {
        let item = self.first_item();
        let start = self
            .current_period_start
            .or_else(|| item.and_then(|i| i.current_period_start));
        let end = self
            .current_period_end
            .or_else(|| item.and_then(|i| i.current_period_end));
        period_from_unix(start, end)
    }

    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.as_ref().and_then(|items| items.data.first())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinePeriod {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvoiceLine {
    pub period: Option<LinePeriod>,
    pub price: Option<PriceRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvoiceObject {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub lines: Option<ListObject<InvoiceLine>>,
}

impl InvoiceObject {
    /// The subscription period this invoice pays for.
    pub fn period(&self) -> Result<Option<BillingPeriod>, WebhookError> {
        match self.first_line().and_then(|l| l.period.as_ref()) {
            Some(p) => period_from_unix(Some(p.start), Some(p.end)),
            None => Ok(None),
        }
    }

    pub fn price_id(&self) -> Option<&str> {
        self.first_line()
            .and_then(|l| l.price.as_ref())
            .map(|p| p.id.as_str())
    }

    fn first_line(&self) -> Option<&InvoiceLine> {
        self.lines.as_ref().and_then(|lines| lines.data.first())
    }
}

fn period_from_unix(
    start: Option<i64>,
    end: Option<i64>,
) -> Result<Option<BillingPeriod>, WebhookError> {
    let (Some(start), Some(end)) = (start, end) else {
        return Ok(None);
    };
    let start = Timestamp::from_unix_secs(start)
        .ok_or_else(|| WebhookError::ParseError(format!("invalid period start {}", start)))?;
    let end = Timestamp::from_unix_secs(end)
        .ok_or_else(|| WebhookError::ParseError(format!("invalid period end {}", end)))?;
    BillingPeriod::new(start, end)
        .map(Some)
        .map_err(|e| WebhookError::ParseError(e.to_string()))
}

// ════════════════════════════════════════════════════════════════════
// Interpretation
// ════════════════════════════════════════════════════════════════════

/// A completed checkout, resolved against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub practitioner_id: PractitionerId,
    pub tier: TierId,
    pub cycle: BillingCycle,
    /// `None` when the session carries no expanded subscription.
    pub period: Option<BillingPeriod>,
    pub provider_customer_id: String,
    pub provider_subscription_id: String,
}

/// The state change an event asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingChange {
    Checkout(CheckoutCompleted),
    /// Renewal or plan/period update.
    Refresh {
        provider_subscription_id: String,
        refresh: PeriodRefresh,
    },
    PaymentFailed {
        provider_subscription_id: String,
        period: Option<BillingPeriod>,
    },
    Deleted {
        provider_subscription_id: String,
        at_period_end: bool,
    },
    /// Nothing to apply.
    Ignored {
        provider_subscription_id: Option<String>,
        reason: String,
    },
}

impl BillingChange {
    pub fn provider_subscription_id(&self) -> Option<&str> {
        match self {
            BillingChange::Checkout(c) => Some(&c.provider_subscription_id),
            BillingChange::Refresh {
                provider_subscription_id,
                ..
            }
            | BillingChange::PaymentFailed {
                provider_subscription_id,
                ..
            }
            | BillingChange::Deleted {
                provider_subscription_id,
                ..
            } => Some(provider_subscription_id),
            BillingChange::Ignored {
                provider_subscription_id,
                ..
            } => provider_subscription_id.as_deref(),
        }
    }
}

/// Turns a verified event into the change it requests.
///
/// # Errors
///
/// `ParseError`, `MissingField` or `UnknownPrice` when the payload cannot be
/// interpreted. Callers record these as malformed.
pub fn interpret(event: &StripeEvent, catalog: &TierCatalog) -> Result<BillingChange, WebhookError> {
    match event.kind() {
        EventKind::CheckoutCompleted => {
            let session: CheckoutSessionObject = event.deserialize_object()?;
            interpret_checkout(session, catalog).map(BillingChange::Checkout)
        }
        EventKind::PaymentSucceeded => {
            let invoice: InvoiceObject = event.deserialize_object()?;
            let Some(subscription_id) = invoice.subscription.clone() else {
                return Ok(BillingChange::Ignored {
                    provider_subscription_id: None,
                    reason: "invoice is not for a subscription".to_string(),
                });
            };
            Ok(BillingChange::Refresh {
                provider_subscription_id: subscription_id,
                refresh: PeriodRefresh {
                    period: invoice.period()?,
                    plan: invoice.price_id().and_then(|p| catalog.resolve_price(p)),
                    cancel_at_period_end: None,
                    payment_current: true,
                },
            })
        }
        EventKind::PaymentFailed => {
            let invoice: InvoiceObject = event.deserialize_object()?;
            let Some(subscription_id) = invoice.subscription.clone() else {
                return Ok(BillingChange::Ignored {
                    provider_subscription_id: None,
                    reason: "invoice is not for a subscription".to_string(),
                });
            };
            Ok(BillingChange::PaymentFailed {
                provider_subscription_id: subscription_id,
                period: invoice.period()?,
            })
        }
        EventKind::SubscriptionUpdated => {
            let subscription: SubscriptionObject = event.deserialize_object()?;
            Ok(BillingChange::Refresh {
                refresh: PeriodRefresh {
                    period: subscription.period()?,
                    plan: subscription.price_id().and_then(|p| catalog.resolve_price(p)),
                    cancel_at_period_end: Some(subscription.cancel_at_period_end),
                    payment_current: subscription.status.is_paid_up(),
                },
                provider_subscription_id: subscription.id,
            })
        }
        EventKind::SubscriptionDeleted => {
            let subscription: SubscriptionObject = event.deserialize_object()?;
            Ok(BillingChange::Deleted {
                at_period_end: subscription.cancel_at_period_end,
                provider_subscription_id: subscription.id,
            })
        }
        EventKind::Other => Ok(BillingChange::Ignored {
            provider_subscription_id: None,
            reason: format!("unhandled event type {}", event.event_type),
        }),
    }
}

fn interpret_checkout(
    session: CheckoutSessionObject,
    catalog: &TierCatalog,
) -> Result<CheckoutCompleted, WebhookError> {
    let practitioner = session
        .metadata
        .get("practitioner_id")
        .cloned()
        .or(session.client_reference_id)
        .ok_or(WebhookError::MissingField("metadata.practitioner_id"))?;
    let practitioner_id =
        PractitionerId::new(practitioner).map_err(|e| WebhookError::ParseError(e.to_string()))?;

    let price_id = session
        .metadata
        .get("price_id")
        .ok_or(WebhookError::MissingField("metadata.price_id"))?;
    let (tier, cycle) = catalog
        .resolve_price(price_id)
        .ok_or_else(|| WebhookError::UnknownPrice(price_id.clone()))?;

    let customer = session
        .customer
        .ok_or(WebhookError::MissingField("customer"))?;

    let (subscription_id, period) = match session.subscription {
        Some(Expandable::Id(id)) => (id, None),
        Some(Expandable::Object(sub)) => {
            let period = sub.period()?;
            (sub.id, period)
        }
        None => return Err(WebhookError::MissingField("subscription")),
    };

    Ok(CheckoutCompleted {
        practitioner_id,
        tier,
        cycle,
        period,
        provider_customer_id: customer,
        provider_subscription_id: subscription_id,
    })
}

/// Builder for test events.
#[cfg(test)]
pub struct StripeEventBuilder {
    id: String,
    event_type: String,
    created: i64,
    object: serde_json::Value,
}

#[cfg(test)]
impl Default for StripeEventBuilder {
    fn default() -> Self {
        Self {
            id: "evt_test_123".to_string(),
            event_type: "checkout.session.completed".to_string(),
            created: 1_735_689_600,
            object: serde_json::json!({}),
        }
    }
}

#[cfg(test)]
impl StripeEventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn created(mut self, created: i64) -> Self {
        self.created = created;
        self
    }

    pub fn object(mut self, object: serde_json::Value) -> Self {
        self.object = object;
        self
    }

    pub fn build(self) -> StripeEvent {
        StripeEvent {
            id: self.id,
            event_type: self.event_type,
            created: self.created,
            data: StripeEventData {
                object: self.object,
            },
            livemode: false,
            api_version: Some("2024-06-20".to_string()),
        }
    }
}
