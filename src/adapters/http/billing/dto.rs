//! HTTP DTOs for billing endpoints.
//!
//! JSON request/response shapes at the boundary between HTTP and the
//! application layer.

use serde::{Deserialize, Serialize};

use crate::application::handlers::billing::{InitiateCheckoutResult, WebhookOutcome};
use crate::domain::billing::{BillingCycle, LeadQuota, QuotaUsage, TierConfig, TierId};
use crate::domain::foundation::Timestamp;

// ════════════════════════════════════════════════════════════════════════════════
// Request DTOs
// ════════════════════════════════════════════════════════════════════════════════

/// Request to start a hosted checkout.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    /// Tier name; validated against the catalog by the handler.
    pub tier: String,
    #[serde(default)]
    pub billing_cycle: BillingCycle,
    /// Prefills the provider customer.
    #[serde(default)]
    pub email: Option<String>,
}

// ════════════════════════════════════════════════════════════════════════════════
// Response DTOs
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub redirect_url: String,
    pub session_id: String,
    pub tier: TierId,
    pub billing_cycle: BillingCycle,
}

impl From<InitiateCheckoutResult> for CheckoutResponse {
    fn from(result: InitiateCheckoutResult) -> Self {
        Self {
            redirect_url: result.redirect_url,
            session_id: result.session_id,
            tier: result.tier,
            billing_cycle: result.billing_cycle,
        }
    }
}

/// One catalog entry. Provider price ids stay server-side.
#[derive(Debug, Clone, Serialize)]
pub struct TierResponse {
    pub id: TierId,
    pub name: String,
    pub monthly_price_cents: u32,
    pub annual_price_cents: u32,
    /// Leads per period; null means unlimited.
    pub lead_quota: Option<u32>,
    pub article_quota: Option<u32>,
    pub event_quota: Option<u32>,
    pub purchasable: bool,
}

impl From<TierConfig> for TierResponse {
    fn from(config: TierConfig) -> Self {
        let purchasable = config.is_paid();
        Self {
            id: config.id,
            name: config.name,
            monthly_price_cents: config.monthly_price_cents,
            annual_price_cents: config.annual_price_cents,
            lead_quota: match config.lead_quota {
                LeadQuota::Limited(n) => Some(n),
                LeadQuota::Unlimited => None,
            },
            article_quota: config.article_quota,
            event_quota: config.event_quota,
            purchasable,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TiersResponse {
    pub tiers: Vec<TierResponse>,
}

/// Lead quota for the current period.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaResponse {
    pub tier: TierId,
    pub used: u64,
    /// Null when unlimited.
    pub limit: Option<u32>,
    /// Null when unlimited.
    pub remaining: Option<u64>,
    pub unlimited: bool,
    pub period_start: Timestamp,
    pub period_end: Timestamp,
}

impl From<QuotaUsage> for QuotaResponse {
    fn from(usage: QuotaUsage) -> Self {
        Self {
            tier: usage.tier,
            used: usage.used,
            limit: usage.limit,
            remaining: usage.remaining,
            unlimited: usage.unlimited,
            period_start: usage.period_start,
            period_end: usage.period_end,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CanConsumeResponse {
    pub allowed: bool,
}

/// Acknowledgement for every webhook that should not be redelivered.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAckResponse {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

impl WebhookAckResponse {
    pub fn new(outcome: WebhookOutcome) -> Self {
        Self {
            received: true,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

// ════════════════════════════════════════════════════════════════════════════════
// Error Response
// ════════════════════════════════════════════════════════════════════════════════

/// Error body shared by all billing endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Some(details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billing::test_catalog;

    #[test]
    fn checkout_request_defaults_to_monthly() {
        let request: CheckoutRequest = serde_json::from_str(r#"{"tier":"starter"}"#).unwrap();
        assert_eq!(request.billing_cycle, BillingCycle::Monthly);
        assert!(request.email.is_none());
    }

    #[test]
    fn checkout_request_rejects_unknown_cycle() {
        let result: Result<CheckoutRequest, _> =
            serde_json::from_str(r#"{"tier":"starter","billing_cycle":"weekly"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn tier_response_hides_price_ids() {
        let catalog = test_catalog();
        let elite = catalog.lookup(TierId::Elite).unwrap().clone();

        let json = serde_json::to_value(TierResponse::from(elite)).unwrap();

        assert_eq!(json["id"], "elite");
        assert!(json["lead_quota"].is_null());
        assert_eq!(json["purchasable"], true);
        assert!(json.get("price_ids").is_none());
    }

    #[test]
    fn webhook_ack_serializes_outcome() {
        let json = serde_json::to_string(&WebhookAckResponse::new(WebhookOutcome::Duplicate)).unwrap();
        assert_eq!(json, r#"{"received":true,"outcome":"duplicate"}"#);
    }

    #[test]
    fn error_response_omits_missing_details() {
        let json = serde_json::to_string(&ErrorResponse::new("UNKNOWN_TIER", "nope")).unwrap();
        assert_eq!(json, r#"{"code":"UNKNOWN_TIER","message":"nope"}"#);
    }

    #[test]
    fn error_response_with_details_includes_details() {
        let details = serde_json::json!({"field": "tier"});
        let response = ErrorResponse::with_details("VALIDATION_FAILED", "Invalid", details.clone());
        assert_eq!(response.details, Some(details));
    }
}
