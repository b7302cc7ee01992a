//! Stripe REST API response bodies.
//!
//! Only the fields we read are captured. Subscription responses reuse the
//! webhook payload type since Stripe renders the same object in both.

use serde::Deserialize;

pub use crate::domain::billing::SubscriptionObject as StripeSubscription;

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

/// `GET /v1/customers/search` page.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomerSearch {
    #[serde(default)]
    pub data: Vec<StripeCustomer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    /// Hosted page. Absent only for embedded sessions, which we never create.
    pub url: Option<String>,
}

/// Error envelope Stripe returns with 4xx/5xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorBody {
    pub error: StripeErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorDetail {
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}
