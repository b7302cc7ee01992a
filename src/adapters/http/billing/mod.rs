//! Billing HTTP adapter.
//!
//! Exposes checkout, subscription, quota and webhook endpoints under
//! `/api/billing`.

pub mod dto;
pub mod handlers;
pub mod routes;

pub use handlers::{
    AuthenticatedPractitioner, BillingApiError, BillingAppState, WebhookApiError,
    PRACTITIONER_HEADER, STRIPE_SIGNATURE_HEADER,
};
pub use routes::{app_router, billing_router, billing_routes, webhook_routes};
