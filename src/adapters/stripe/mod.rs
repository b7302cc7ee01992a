//! Stripe payment provider adapter.
//!
//! Implements the `PaymentProvider` port for Stripe:
//! - Customer lookup and creation
//! - Hosted checkout sessions
//! - Subscription reads for reconciliation
//!
//! Webhook signature verification lives in the billing domain since it
//! needs no network access.
//!
//! # Configuration
//!
//! Required environment variables:
//! - `PRACTICE_BILLING__PAYMENT__STRIPE_API_KEY`: Stripe secret API key
//! - `PRACTICE_BILLING__PAYMENT__STRIPE_WEBHOOK_SECRET`: Webhook signing secret (whsec_...)

mod api_types;
mod mock_payment_provider;
mod stripe_adapter;

pub use api_types::{
    StripeCheckoutSession, StripeCustomer, StripeCustomerSearch, StripeErrorBody,
    StripeErrorDetail, StripeSubscription,
};
pub use mock_payment_provider::{MethodCall, MockPaymentProvider};
pub use stripe_adapter::{StripeConfig, StripePaymentAdapter};
