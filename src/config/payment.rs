//! Payment configuration

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::domain::billing::{PriceIds, TierCatalog};

use super::error::ValidationError;

/// Payment configuration (Stripe)
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    /// Stripe API key
    pub stripe_api_key: SecretString,

    /// Stripe webhook signing secret
    pub stripe_webhook_secret: SecretString,

    /// Stripe API origin, overridable for stubs
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Reject webhook events not flagged `livemode`
    #[serde(default)]
    pub require_livemode: bool,

    #[serde(default)]
    pub starter_monthly_price_id: String,
    #[serde(default)]
    pub starter_annual_price_id: String,
    #[serde(default)]
    pub professional_monthly_price_id: String,
    #[serde(default)]
    pub professional_annual_price_id: String,
    #[serde(default)]
    pub elite_monthly_price_id: String,
    #[serde(default)]
    pub elite_annual_price_id: String,

    /// Where checkout returns after payment
    pub success_url: String,

    /// Where checkout returns when abandoned
    pub cancel_url: String,

    /// Per-request timeout for Stripe API calls in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl PaymentConfig {
    /// Check if using Stripe test mode
    pub fn is_test_mode(&self) -> bool {
        self.stripe_api_key.expose_secret().starts_with("sk_test_")
    }

    /// Check if using Stripe live mode
    pub fn is_live_mode(&self) -> bool {
        self.stripe_api_key.expose_secret().starts_with("sk_live_")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Build the tier catalog from the configured price ids.
    pub fn catalog(&self) -> Result<TierCatalog, ValidationError> {
        TierCatalog::standard(
            PriceIds::new(&self.starter_monthly_price_id, &self.starter_annual_price_id),
            PriceIds::new(
                &self.professional_monthly_price_id,
                &self.professional_annual_price_id,
            ),
            PriceIds::new(&self.elite_monthly_price_id, &self.elite_annual_price_id),
        )
        .map_err(|e| ValidationError::InvalidCatalog(e.to_string()))
    }

    /// Validate payment configuration
    pub fn validate(&self, production: bool) -> Result<(), ValidationError> {
        let api_key = self.stripe_api_key.expose_secret();
        let webhook_secret = self.stripe_webhook_secret.expose_secret();

        if api_key.is_empty() {
            return Err(ValidationError::MissingRequired("STRIPE_API_KEY"));
        }
        if webhook_secret.is_empty() {
            return Err(ValidationError::MissingRequired("STRIPE_WEBHOOK_SECRET"));
        }

        // Verify key prefixes for safety
        if !api_key.starts_with("sk_") {
            return Err(ValidationError::InvalidStripeKey);
        }
        if !webhook_secret.starts_with("whsec_") {
            return Err(ValidationError::InvalidStripeWebhookSecret);
        }

        validate_redirect("success_url", &self.success_url, production)?;
        validate_redirect("cancel_url", &self.cancel_url, production)?;

        if self.request_timeout_secs == 0 || self.request_timeout_secs > 120 {
            return Err(ValidationError::InvalidTimeout);
        }

        self.catalog()?;
        Ok(())
    }
}

fn validate_redirect(
    field: &'static str,
    url: &str,
    production: bool,
) -> Result<(), ValidationError> {
    if url.is_empty() {
        return Err(ValidationError::MissingRequired(field));
    }
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(ValidationError::InvalidRedirectUrl(field));
    }
    if production && !url.starts_with("https://") {
        return Err(ValidationError::RedirectMustBeHttps);
    }
    Ok(())
}

fn default_api_base_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_request_timeout() -> u64 {
    10
}
