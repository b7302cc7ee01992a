//! Billing domain - Tiers, subscriptions, provider events and lead quotas.
//!
//! # Module Organization
//!
//! - `tier` / `catalog` - Closed tier set and its immutable configuration
//! - `status` / `subscription` - Subscription aggregate and state machine
//! - `billing_event` - Processed-event ledger entries
//! - `events` - Change notifications
//! - `provider_event` - Stripe payloads and their interpretation
//! - `webhook_verifier` - Signature verification
//! - `quota` - Lead quota windows

mod billing_event;
mod catalog;
mod errors;
mod events;
mod provider_event;
mod quota;
mod status;
mod subscription;
mod tier;
mod webhook_errors;
mod webhook_verifier;

pub use billing_event::{BillingEvent, EventOutcome};
pub use catalog::{CatalogError, LeadQuota, PriceIds, TierCatalog, TierConfig};
pub use errors::BillingError;
pub use events::{ChangeSource, SubscriptionChanged};
pub use provider_event::{
    interpret, BillingChange, CheckoutCompleted, CheckoutSessionObject, EventKind, InvoiceObject,
    ProviderStatus, StripeEvent, StripeEventData, SubscriptionObject,
};
pub use quota::{is_entitled, remaining, QuotaUsage, QuotaWindow};
pub use status::SubscriptionStatus;
pub use subscription::{
    Activation, BillingPeriod, PeriodRefresh, ProviderSnapshot, Subscription, TierChange,
};
pub use tier::{BillingCycle, TierId};
pub use webhook_errors::WebhookError;
pub use webhook_verifier::{SignatureHeader, StripeWebhookVerifier, DEFAULT_TOLERANCE_SECS};

#[cfg(test)]
pub(crate) use catalog::test_catalog;
#[cfg(test)]
pub(crate) use webhook_verifier::compute_test_signature;
