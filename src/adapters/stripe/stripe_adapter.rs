//! Stripe payment provider adapter.
//!
//! Implements `PaymentProvider` over Stripe's form-encoded REST API.
//!
//! # Security
//!
//! - The API key is held as `secrecy::SecretString` and only exposed to
//!   build the basic-auth header
//! - Creation calls send an `Idempotency-Key` so retries never duplicate
//!
//! # Configuration
//!
//! ```ignore
//! let config = StripeConfig::new(api_key).with_timeout(Duration::from_secs(10));
//! let adapter = StripePaymentAdapter::new(config)?;
//! ```

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::domain::foundation::PractitionerId;
use crate::ports::{
    CheckoutSession, CreateCheckoutRequest, CreateCustomerRequest, Customer, PaymentError,
    PaymentProvider, ProviderSubscription,
};

use super::api_types::{
    StripeCheckoutSession, StripeCustomer, StripeCustomerSearch, StripeErrorBody,
    StripeSubscription,
};

const DEFAULT_API_BASE_URL: &str = "https://api.stripe.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stripe API configuration.
#[derive(Clone)]
pub struct StripeConfig {
    /// Secret API key (sk_live_... or sk_test_...).
    api_key: SecretString,

    /// Base URL for the Stripe API. Overridden in tests and for stripe-mock.
    api_base_url: String,

    /// Per-request timeout.
    timeout: Duration,
}

impl StripeConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }
}

/// Stripe payment provider adapter.
pub struct StripePaymentAdapter {
    config: StripeConfig,
    http_client: reqwest::Client,
}

impl StripePaymentAdapter {
    /// # Errors
    ///
    /// `NetworkError` if the HTTP client cannot be built.
    pub fn new(config: StripeConfig) -> Result<Self, PaymentError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, PaymentError> {
        request
            .basic_auth(self.config.api_key.expose_secret(), Option::<&str>::None)
            .send()
            .await
            .map_err(classify_transport_error)
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<T, PaymentError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status, &body);
            tracing::warn!(
                operation,
                status = status.as_u16(),
                code = %err.code,
                retryable = err.retryable,
                "Stripe API call failed"
            );
            return Err(err);
        }
        response.json().await.map_err(|e| {
            PaymentError::provider(format!("Failed to parse Stripe {} response: {}", operation, e))
        })
    }
}

/// Maps a reqwest failure to a payment error.
fn classify_transport_error(e: reqwest::Error) -> PaymentError {
    if e.is_timeout() {
        PaymentError::timeout(e.to_string())
    } else {
        PaymentError::network(e.to_string())
    }
}

/// Maps a non-success HTTP status (plus Stripe's error body) to a payment error.
fn classify_status(status: reqwest::StatusCode, body: &str) -> PaymentError {
    let detail = serde_json::from_str::<StripeErrorBody>(body).ok().map(|b| b.error);
    let message = detail
        .as_ref()
        .and_then(|d| d.message.clone())
        .unwrap_or_else(|| format!("Stripe returned {}", status));

    let err = match status.as_u16() {
        401 | 403 => PaymentError::authentication(message),
        429 => PaymentError::rate_limited(message),
        s if s >= 500 => PaymentError::provider(message),
        _ => PaymentError::invalid_request(message),
    };

    match detail.and_then(|d| d.code.or(d.error_type)) {
        Some(code) => err.with_provider_code(code),
        None => err,
    }
}

fn to_customer(customer: StripeCustomer) -> Customer {
    Customer {
        id: customer.id,
        email: customer.email,
    }
}

fn to_provider_subscription(sub: StripeSubscription) -> ProviderSubscription {
    let item = sub.items.as_ref().and_then(|items| items.data.first());
    ProviderSubscription {
        price_id: sub.price_id().map(str::to_string),
        current_period_start: sub
            .current_period_start
            .or_else(|| item.and_then(|i| i.current_period_start)),
        current_period_end: sub
            .current_period_end
            .or_else(|| item.and_then(|i| i.current_period_end)),
        customer_id: sub.customer.clone().unwrap_or_default(),
        status: sub.status,
        cancel_at_period_end: sub.cancel_at_period_end,
        id: sub.id,
    }
}

#[async_trait]
impl PaymentProvider for StripePaymentAdapter {
    async fn find_customer(
        &self,
        practitioner_id: &PractitionerId,
    ) -> Result<Option<Customer>, PaymentError> {
        let query = format!("metadata['practitioner_id']:'{}'", practitioner_id);
        let response = self
            .send(
                self.http_client
                    .get(self.url("/v1/customers/search"))
                    .query(&[("query", query.as_str()), ("limit", "1")]),
            )
            .await?;

        let page: StripeCustomerSearch = self.read_json(response, "customer search").await?;
        Ok(page
            .data
            .into_iter()
            .find(|c| !c.deleted)
            .map(to_customer))
    }

    async fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> Result<Customer, PaymentError> {
        let mut params = vec![(
            "metadata[practitioner_id]",
            request.practitioner_id.to_string(),
        )];
        if let Some(email) = &request.email {
            params.push(("email", email.clone()));
        }

        let response = self
            .send(
                self.http_client
                    .post(self.url("/v1/customers"))
                    .header("Idempotency-Key", &request.idempotency_key)
                    .form(&params),
            )
            .await?;

        let customer: StripeCustomer = self.read_json(response, "create customer").await?;
        tracing::info!(
            practitioner_id = %request.practitioner_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );
        Ok(to_customer(customer))
    }

    async fn create_checkout_session(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        let mut params = vec![
            ("mode", "subscription".to_string()),
            ("customer", request.customer_id.clone()),
            ("client_reference_id", request.practitioner_id.to_string()),
            ("line_items[0][price]", request.price_id.clone()),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", request.success_url.clone()),
            ("cancel_url", request.cancel_url.clone()),
        ];
        for (key, value) in request.metadata() {
            params.push((metadata_key(key), value.clone()));
            params.push((subscription_metadata_key(key), value));
        }

        let response = self
            .send(
                self.http_client
                    .post(self.url("/v1/checkout/sessions"))
                    .form(&params),
            )
            .await?;

        let session: StripeCheckoutSession = self.read_json(response, "create checkout").await?;
        let url = session.url.ok_or_else(|| {
            PaymentError::provider(format!("Checkout session {} has no hosted URL", session.id))
        })?;

        Ok(CheckoutSession {
            id: session.id,
            url,
        })
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProviderSubscription>, PaymentError> {
        let response = self
            .send(
                self.http_client
                    .get(self.url(&format!("/v1/subscriptions/{}", subscription_id))),
            )
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let sub: StripeSubscription = self.read_json(response, "get subscription").await?;
        Ok(Some(to_provider_subscription(sub)))
    }
}

fn metadata_key(key: &str) -> &'static str {
    match key {
        "practitioner_id" => "metadata[practitioner_id]",
        "tier" => "metadata[tier]",
        "billing_cycle" => "metadata[billing_cycle]",
        _ => "metadata[price_id]",
    }
}

/// Metadata copied onto the subscription so later subscription events
/// carry it too.
fn subscription_metadata_key(key: &str) -> &'static str {
    match key {
        "practitioner_id" => "subscription_data[metadata][practitioner_id]",
        "tier" => "subscription_data[metadata][tier]",
        "billing_cycle" => "subscription_data[metadata][billing_cycle]",
        _ => "subscription_data[metadata][price_id]",
    }
}
