//! InitiateCheckoutHandler - Starts a hosted checkout for a paid tier.
//!
//! Never touches subscription state. The subscription only changes once the
//! provider confirms payment through the completion webhook.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::billing::{BillingCycle, BillingError, TierCatalog, TierId};
use crate::domain::foundation::PractitionerId;
use crate::ports::{
    CheckoutSession, CreateCheckoutRequest, CreateCustomerRequest, Customer, PaymentProvider,
    SubscriptionRepository,
};

/// Command to start a checkout.
#[derive(Debug, Clone)]
pub struct InitiateCheckoutCommand {
    pub practitioner_id: PractitionerId,
    /// Untrusted tier name from the request.
    pub tier: String,
    pub billing_cycle: BillingCycle,
    pub email: Option<String>,
}

/// Result of a successful checkout initiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateCheckoutResult {
    pub redirect_url: String,
    pub session_id: String,
    pub customer_id: String,
    pub tier: TierId,
    pub billing_cycle: BillingCycle,
}

/// Redirect targets and deadline for checkout.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub success_url: String,
    pub cancel_url: String,
    /// Bound on the whole provider interaction.
    pub timeout: Duration,
}

pub struct InitiateCheckoutHandler {
    repository: Arc<dyn SubscriptionRepository>,
    payment_provider: Arc<dyn PaymentProvider>,
    catalog: Arc<TierCatalog>,
    settings: CheckoutSettings,
}

impl InitiateCheckoutHandler {
    pub fn new(
        repository: Arc<dyn SubscriptionRepository>,
        payment_provider: Arc<dyn PaymentProvider>,
        catalog: Arc<TierCatalog>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            repository,
            payment_provider,
            catalog,
            settings,
        }
    }

    /// # Errors
    ///
    /// - `UnknownTier` - tier name not in the catalog
    /// - `FreeTierNotPurchasable` - free tier requested
    /// - `BillingProvider` - provider failure or timeout
    /// - `Persistence` - stored subscription could not be read
    pub async fn handle(
        &self,
        cmd: InitiateCheckoutCommand,
    ) -> Result<InitiateCheckoutResult, BillingError> {
        // 1. Resolve the tier and its price
        let config = self.catalog.lookup_str(&cmd.tier)?;
        if !config.is_paid() {
            return Err(BillingError::FreeTierNotPurchasable);
        }
        let tier = config.id;
        let price_id = config
            .price_id(cmd.billing_cycle)
            .ok_or_else(|| {
                BillingError::validation(
                    "billing_cycle",
                    format!("tier '{}' has no {} price", tier, cmd.billing_cycle),
                )
            })?
            .to_string();

        // 2. A stored customer id is reused without asking the provider
        let stored_customer = self
            .repository
            .get_current(&cmd.practitioner_id)
            .await?
            .and_then(|s| s.provider_customer_id);

        // 3. Provider calls, bounded as one unit
        let work = self.create_session(&cmd, tier, price_id, stored_customer);
        let (customer, session) = tokio::time::timeout(self.settings.timeout, work)
            .await
            .map_err(|_| {
                tracing::warn!(
                    practitioner_id = %cmd.practitioner_id,
                    timeout_ms = self.settings.timeout.as_millis() as u64,
                    "Checkout provider interaction timed out"
                );
                BillingError::provider("billing provider timed out", true)
            })??;

        tracing::info!(
            practitioner_id = %cmd.practitioner_id,
            tier = %tier,
            billing_cycle = %cmd.billing_cycle,
            session_id = %session.id,
            "Checkout session created"
        );

        Ok(InitiateCheckoutResult {
            redirect_url: session.url,
            session_id: session.id,
            customer_id: customer.id,
            tier,
            billing_cycle: cmd.billing_cycle,
        })
    }

    async fn create_session(
        &self,
        cmd: &InitiateCheckoutCommand,
        tier: TierId,
        price_id: String,
        stored_customer: Option<String>,
    ) -> Result<(Customer, CheckoutSession), BillingError> {
        let customer = match stored_customer {
            Some(id) => Customer {
                id,
                email: cmd.email.clone(),
            },
            None => self.find_or_create_customer(cmd).await?,
        };

        let session = self
            .payment_provider
            .create_checkout_session(CreateCheckoutRequest {
                customer_id: customer.id.clone(),
                practitioner_id: cmd.practitioner_id.clone(),
                tier,
                billing_cycle: cmd.billing_cycle,
                price_id,
                success_url: self.settings.success_url.clone(),
                cancel_url: self.settings.cancel_url.clone(),
            })
            .await?;

        Ok((customer, session))
    }

    async fn find_or_create_customer(
        &self,
        cmd: &InitiateCheckoutCommand,
    ) -> Result<Customer, BillingError> {
        if let Some(found) = self
            .payment_provider
            .find_customer(&cmd.practitioner_id)
            .await?
        {
            tracing::debug!(customer_id = %found.id, "Reusing provider customer");
            return Ok(found);
        }

        let created = self
            .payment_provider
            .create_customer(CreateCustomerRequest::for_practitioner(
                cmd.practitioner_id.clone(),
                cmd.email.clone(),
            ))
            .await?;
        Ok(created)
    }
}
