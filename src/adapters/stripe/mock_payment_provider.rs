//! Mock payment provider for testing.
//!
//! Provides a configurable mock implementation of `PaymentProvider` for unit
//! and integration tests. Supports:
//! - Pre-configured customers and subscriptions
//! - Error injection per method
//! - Artificial latency for timeout tests
//! - Call tracking

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::foundation::PractitionerId;
use crate::ports::{
    CheckoutSession, CreateCheckoutRequest, CreateCustomerRequest, Customer, PaymentError,
    PaymentProvider, ProviderSubscription,
};

/// Mock payment provider for testing.
///
/// # Example
///
/// ```ignore
/// let mock = MockPaymentProvider::new();
/// mock.add_subscription(subscription);
/// mock.set_method_error("get_subscription", PaymentError::timeout("slow"));
/// ```
#[derive(Default, Clone)]
pub struct MockPaymentProvider {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    /// Customers keyed by practitioner.
    customers: HashMap<PractitionerId, Customer>,

    /// Subscriptions keyed by provider subscription id.
    subscriptions: HashMap<String, ProviderSubscription>,

    /// Errors keyed by method name.
    method_errors: HashMap<&'static str, PaymentError>,

    /// Delay applied before every call.
    delay: Option<Duration>,

    next_id: u64,

    call_log: Vec<MethodCall>,
}

/// Recorded method call for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    pub method: &'static str,
    pub args: Vec<String>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Configuration Methods
    // ════════════════════════════════════════════════════════════════════════════

    /// Registers an existing customer for a practitioner.
    pub fn add_customer(&self, practitioner_id: PractitionerId, customer: Customer) {
        self.state().customers.insert(practitioner_id, customer);
    }

    /// Registers the provider-side view of a subscription.
    pub fn add_subscription(&self, subscription: ProviderSubscription) {
        let id = subscription.id.clone();
        self.state().subscriptions.insert(id, subscription);
    }

    pub fn remove_subscription(&self, subscription_id: &str) {
        self.state().subscriptions.remove(subscription_id);
    }

    /// Fails every call to `method` with `error` until cleared.
    pub fn set_method_error(&self, method: &'static str, error: PaymentError) {
        self.state().method_errors.insert(method, error);
    }

    pub fn clear_errors(&self) {
        self.state().method_errors.clear();
    }

    /// Sleeps before answering each call.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    // ════════════════════════════════════════════════════════════════════════════
    // Assertions
    // ════════════════════════════════════════════════════════════════════════════

    pub fn calls(&self) -> Vec<MethodCall> {
        self.state().call_log.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state()
            .call_log
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub fn was_called(&self, method: &str) -> bool {
        self.call_count(method) > 0
    }

    /// Logs the call, applies the delay, and returns any injected error.
    async fn enter(&self, method: &'static str, args: Vec<String>) -> Result<(), PaymentError> {
        let (delay, error) = {
            let mut state = self.state();
            state.call_log.push(MethodCall { method, args });
            (state.delay, state.method_errors.get(method).cloned())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn find_customer(
        &self,
        practitioner_id: &PractitionerId,
    ) -> Result<Option<Customer>, PaymentError> {
        self.enter("find_customer", vec![practitioner_id.to_string()])
            .await?;
        Ok(self.state().customers.get(practitioner_id).cloned())
    }

    async fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> Result<Customer, PaymentError> {
        self.enter(
            "create_customer",
            vec![request.practitioner_id.to_string(), request.idempotency_key.clone()],
        )
        .await?;

        let mut state = self.state();
        if let Some(existing) = state.customers.get(&request.practitioner_id) {
            return Ok(existing.clone());
        }
        state.next_id += 1;
        let customer = Customer {
            id: format!("cus_mock_{}", state.next_id),
            email: request.email,
        };
        state
            .customers
            .insert(request.practitioner_id, customer.clone());
        Ok(customer)
    }

    async fn create_checkout_session(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        self.enter(
            "create_checkout_session",
            vec![request.customer_id.clone(), request.price_id.clone()],
        )
        .await?;

        let mut state = self.state();
        state.next_id += 1;
        let id = format!("cs_mock_{}", state.next_id);
        Ok(CheckoutSession {
            url: format!("https://checkout.mock.test/pay/{}", id),
            id,
        })
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProviderSubscription>, PaymentError> {
        self.enter("get_subscription", vec![subscription_id.to_string()])
            .await?;
        Ok(self.state().subscriptions.get(subscription_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billing::ProviderStatus;
    use crate::ports::PaymentErrorCode;

    fn practitioner() -> PractitionerId {
        PractitionerId::new("prac-1").unwrap()
    }

    #[tokio::test]
    async fn create_customer_is_idempotent_per_practitioner() {
        let mock = MockPaymentProvider::new();
        let first = mock
            .create_customer(CreateCustomerRequest::for_practitioner(practitioner(), None))
            .await
            .unwrap();
        let second = mock
            .create_customer(CreateCustomerRequest::for_practitioner(practitioner(), None))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(mock.call_count("create_customer"), 2);
        assert_eq!(
            mock.find_customer(&practitioner()).await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn injected_error_is_returned() {
        let mock = MockPaymentProvider::new();
        mock.set_method_error("get_subscription", PaymentError::rate_limited("slow down"));

        let err = mock.get_subscription("sub_1").await.unwrap_err();
        assert_eq!(err.code, PaymentErrorCode::RateLimitExceeded);

        mock.clear_errors();
        assert!(mock.get_subscription("sub_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn returns_registered_subscription() {
        let mock = MockPaymentProvider::new();
        mock.add_subscription(ProviderSubscription {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status: ProviderStatus::Active,
            current_period_start: Some(0),
            current_period_end: Some(100),
            cancel_at_period_end: false,
            price_id: Some("price_pro_m".to_string()),
        });

        let sub = mock.get_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(sub.status, ProviderStatus::Active);
        assert!(mock.was_called("get_subscription"));
    }

    #[tokio::test]
    async fn checkout_sessions_get_distinct_urls() {
        let mock = MockPaymentProvider::new();
        let request = CreateCheckoutRequest {
            customer_id: "cus_1".to_string(),
            practitioner_id: practitioner(),
            tier: crate::domain::billing::TierId::Starter,
            billing_cycle: crate::domain::billing::BillingCycle::Monthly,
            price_id: "price_starter_m".to_string(),
            success_url: "https://app.test/ok".to_string(),
            cancel_url: "https://app.test/cancel".to_string(),
        };
        let a = mock.create_checkout_session(request.clone()).await.unwrap();
        let b = mock.create_checkout_session(request).await.unwrap();
        assert_ne!(a.url, b.url);
    }
}
