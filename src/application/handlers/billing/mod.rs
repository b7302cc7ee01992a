//! Billing handlers.
//!
//! ## Commands
//! - Starting a hosted checkout
//! - Processing provider webhooks
//!
//! ## Queries
//! - Tier catalog listing
//! - Current subscription view
//! - Lead quota usage

mod get_subscription;
mod initiate_checkout;
mod list_tiers;
mod process_webhook;
mod quota;

// Commands
pub use initiate_checkout::{
    CheckoutSettings, InitiateCheckoutCommand, InitiateCheckoutHandler, InitiateCheckoutResult,
};
pub use process_webhook::{
    ProcessWebhookCommand, ProcessWebhookHandler, WebhookOutcome, WebhookSettings,
};

// Queries
pub use get_subscription::{GetSubscriptionHandler, GetSubscriptionQuery, SubscriptionView};
pub use list_tiers::ListTiersHandler;
pub use quota::QuotaAccountant;
