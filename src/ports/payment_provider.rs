//! Payment provider port for external payment processing.
//!
//! Covers the calls billing makes outbound: customer lookup and creation,
//! hosted checkout sessions, and subscription reads for reconciliation.
//! Inbound webhooks are verified in the domain, not through this port.
//!
//! # Design
//!
//! - **Idempotent**: creation calls carry an idempotency key
//! - **Classified errors**: every failure says whether a retry can help

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::billing::{BillingCycle, BillingError, ProviderStatus, TierId};
use crate::domain::foundation::PractitionerId;

/// Port for payment provider integrations.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Finds a customer tagged with the practitioner id.
    async fn find_customer(
        &self,
        practitioner_id: &PractitionerId,
    ) -> Result<Option<Customer>, PaymentError>;

    /// Creates a customer tagged with the practitioner id.
    async fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> Result<Customer, PaymentError>;

    /// Creates a hosted checkout session for a subscription.
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError>;

    /// Current provider-side state of a subscription. `None` if the
    /// provider no longer knows it.
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProviderSubscription>, PaymentError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCustomerRequest {
    pub practitioner_id: PractitionerId,
    pub email: Option<String>,
    pub idempotency_key: String,
}

impl CreateCustomerRequest {
    /// Request keyed idempotently on the practitioner.
    pub fn for_practitioner(practitioner_id: PractitionerId, email: Option<String>) -> Self {
        let idempotency_key = format!("customer-{}", practitioner_id);
        Self {
            practitioner_id,
            email,
            idempotency_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCheckoutRequest {
    pub customer_id: String,
    pub practitioner_id: PractitionerId,
    pub tier: TierId,
    pub billing_cycle: BillingCycle,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl CreateCheckoutRequest {
    /// Metadata attached to the session so the completion webhook can be
    /// resolved without another provider call.
    pub fn metadata(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("practitioner_id", self.practitioner_id.to_string()),
            ("tier", self.tier.to_string()),
            ("billing_cycle", self.billing_cycle.to_string()),
            ("price_id", self.price_id.clone()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    /// Hosted checkout page.
    pub url: String,
}

/// Subscription as the provider currently sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: ProviderStatus,
    /// Unix seconds.
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
    pub price_id: Option<String>,
}

/// Errors from payment provider operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentError {
    pub code: PaymentErrorCode,
    pub message: String,
    /// Provider's error code, if it sent one.
    pub provider_code: Option<String>,
    pub retryable: bool,
}

impl PaymentError {
    pub fn new(code: PaymentErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider_code: None,
            retryable: code.is_retryable(),
        }
    }

    pub fn with_provider_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorCode::NetworkError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorCode::Timeout, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorCode::AuthenticationError, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorCode::RateLimitExceeded, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorCode::ProviderError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorCode::InvalidRequest, message)
    }
}

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PaymentError {}

impl From<PaymentError> for BillingError {
    fn from(err: PaymentError) -> Self {
        BillingError::provider(err.to_string(), err.retryable)
    }
}

/// Payment error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentErrorCode {
    /// Connection refused, reset, DNS.
    NetworkError,
    /// Call exceeded its deadline.
    Timeout,
    /// API key rejected.
    AuthenticationError,
    RateLimitExceeded,
    /// Provider rejected the request as invalid (4xx).
    InvalidRequest,
    /// Provider-side failure (5xx).
    ProviderError,
    Unknown,
}

impl PaymentErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentErrorCode::NetworkError
                | PaymentErrorCode::Timeout
                | PaymentErrorCode::RateLimitExceeded
                | PaymentErrorCode::ProviderError
        )
    }
}

impl std::fmt::Display for PaymentErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentErrorCode::NetworkError => "network_error",
            PaymentErrorCode::Timeout => "timeout",
            PaymentErrorCode::AuthenticationError => "authentication_error",
            PaymentErrorCode::RateLimitExceeded => "rate_limit_exceeded",
            PaymentErrorCode::InvalidRequest => "invalid_request",
            PaymentErrorCode::ProviderError => "provider_error",
            PaymentErrorCode::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
