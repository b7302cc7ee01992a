//! HTTP handlers for billing endpoints.
//!
//! These handlers connect Axum routes to the application layer handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;

use crate::application::handlers::billing::{
    GetSubscriptionHandler, GetSubscriptionQuery, InitiateCheckoutCommand,
    InitiateCheckoutHandler, ListTiersHandler, ProcessWebhookCommand, ProcessWebhookHandler,
    QuotaAccountant,
};
use crate::application::BillingContext;
use crate::domain::billing::{BillingError, WebhookError};
use crate::domain::foundation::{ErrorCode, PractitionerId};

use super::dto::{
    CanConsumeResponse, CheckoutRequest, CheckoutResponse, ErrorResponse, HealthResponse,
    QuotaResponse, TierResponse, TiersResponse, WebhookAckResponse,
};

/// Header carrying the practitioner id set by the upstream identity provider.
pub const PRACTITIONER_HEADER: &str = "X-Practitioner-Id";

/// Header carrying the Stripe webhook signature.
pub const STRIPE_SIGNATURE_HEADER: &str = "Stripe-Signature";

// ════════════════════════════════════════════════════════════════════════════════
// Application State
// ════════════════════════════════════════════════════════════════════════════════

/// Shared state for the billing routes.
///
/// Handlers are built once from the `BillingContext` so every request shares
/// the same ports and subscription locks.
#[derive(Clone)]
pub struct BillingAppState {
    pub checkout: Arc<InitiateCheckoutHandler>,
    pub webhooks: Arc<ProcessWebhookHandler>,
    pub quota: Arc<QuotaAccountant>,
    pub subscriptions: Arc<GetSubscriptionHandler>,
    pub tiers: Arc<ListTiersHandler>,
}

impl BillingAppState {
    pub fn from_context(context: &BillingContext) -> Self {
        Self {
            checkout: Arc::new(context.checkout_handler()),
            webhooks: Arc::new(context.webhook_handler()),
            quota: Arc::new(context.quota_accountant()),
            subscriptions: Arc::new(context.subscription_handler()),
            tiers: Arc::new(context.tiers_handler()),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// Practitioner Context
// ════════════════════════════════════════════════════════════════════════════════

/// Practitioner identified by the upstream identity provider.
#[derive(Debug, Clone)]
pub struct AuthenticatedPractitioner {
    pub practitioner_id: PractitionerId,
}

/// Rejection type for AuthenticatedPractitioner extraction.
pub struct AuthenticationRequired;

impl IntoResponse for AuthenticationRequired {
    fn into_response(self) -> axum::response::Response {
        BillingApiError(BillingError::AuthenticationRequired).into_response()
    }
}

impl<S> axum::extract::FromRequestParts<S> for AuthenticatedPractitioner
where
    S: Send + Sync,
{
    type Rejection = AuthenticationRequired;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut axum::http::request::Parts,
        _state: &'life1 S,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self, Self::Rejection>> + Send + 'async_trait>,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let practitioner_id = parts
                .headers
                .get(PRACTITIONER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .and_then(|s| PractitionerId::new(s).ok())
                .ok_or(AuthenticationRequired)?;

            Ok(AuthenticatedPractitioner { practitioner_id })
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// Query Handlers (GET endpoints)
// ════════════════════════════════════════════════════════════════════════════════

/// GET /api/billing/tiers - Tier catalog
pub async fn list_tiers(State(state): State<BillingAppState>) -> impl IntoResponse {
    let tiers = state
        .tiers
        .handle()
        .into_iter()
        .map(TierResponse::from)
        .collect();
    Json(TiersResponse { tiers })
}

/// GET /api/billing/subscription - Current subscription view
pub async fn get_subscription(
    State(state): State<BillingAppState>,
    practitioner: AuthenticatedPractitioner,
) -> Result<impl IntoResponse, BillingApiError> {
    let view = state
        .subscriptions
        .handle(GetSubscriptionQuery {
            practitioner_id: practitioner.practitioner_id,
        })
        .await?;
    Ok(Json(view))
}

/// GET /api/billing/quota - Lead usage for the current period
pub async fn get_quota(
    State(state): State<BillingAppState>,
    practitioner: AuthenticatedPractitioner,
) -> Result<impl IntoResponse, BillingApiError> {
    let usage = state
        .quota
        .quota_status(&practitioner.practitioner_id)
        .await?;
    Ok(Json(QuotaResponse::from(usage)))
}

/// GET /api/billing/quota/can-consume - Whether one more lead fits
pub async fn can_consume(
    State(state): State<BillingAppState>,
    practitioner: AuthenticatedPractitioner,
) -> Result<impl IntoResponse, BillingApiError> {
    let allowed = state
        .quota
        .can_consume(&practitioner.practitioner_id)
        .await?;
    Ok(Json(CanConsumeResponse { allowed }))
}

/// GET /api/billing/quota/capacity - 204 when a lead fits, 429 otherwise
pub async fn require_capacity(
    State(state): State<BillingAppState>,
    practitioner: AuthenticatedPractitioner,
) -> Result<StatusCode, BillingApiError> {
    state
        .quota
        .require_capacity(&practitioner.practitioner_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /health - Liveness probe
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ════════════════════════════════════════════════════════════════════════════════
// Command Handlers (POST endpoints)
// ════════════════════════════════════════════════════════════════════════════════

/// POST /api/billing/checkout - Start a hosted checkout
pub async fn create_checkout(
    State(state): State<BillingAppState>,
    practitioner: AuthenticatedPractitioner,
    request: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<impl IntoResponse, BillingApiError> {
    let Json(request) =
        request.map_err(|rejection| BillingError::validation("body", rejection.body_text()))?;

    let cmd = InitiateCheckoutCommand {
        practitioner_id: practitioner.practitioner_id,
        tier: request.tier,
        billing_cycle: request.billing_cycle,
        email: request.email,
    };
    let result = state.checkout.handle(cmd).await?;

    Ok(Json(CheckoutResponse::from(result)))
}

/// POST /api/billing/webhooks/stripe - Stripe webhook intake
///
/// Every outcome the provider should not redeliver is acknowledged with 200.
pub async fn handle_stripe_webhook(
    State(state): State<BillingAppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, WebhookApiError> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::InvalidSignature)?;

    let cmd = ProcessWebhookCommand {
        payload: body.to_vec(),
        signature: signature.to_string(),
    };
    let outcome = state.webhooks.handle(cmd).await?;

    Ok(Json(WebhookAckResponse::new(outcome)))
}

// ════════════════════════════════════════════════════════════════════════════════
// Error Handling
// ════════════════════════════════════════════════════════════════════════════════

/// API error type that converts billing errors to HTTP responses.
#[derive(Debug)]
pub struct BillingApiError(BillingError);

impl From<BillingError> for BillingApiError {
    fn from(err: BillingError) -> Self {
        Self(err)
    }
}

impl BillingApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BillingError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            BillingError::UnknownTier(_)
            | BillingError::FreeTierNotPurchasable
            | BillingError::Validation { .. } => StatusCode::BAD_REQUEST,
            BillingError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            BillingError::BillingProvider { retryable: true, .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BillingError::BillingProvider { .. } => StatusCode::BAD_GATEWAY,
            BillingError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BillingApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let code = self.0.code().to_string();
        let body = match &self.0 {
            BillingError::QuotaExceeded { used, limit } => ErrorResponse::with_details(
                code,
                self.0.to_string(),
                serde_json::json!({ "used": used, "limit": limit }),
            ),
            BillingError::Validation { field, .. } => ErrorResponse::with_details(
                code,
                self.0.to_string(),
                serde_json::json!({ "field": field }),
            ),
            BillingError::BillingProvider { retryable, .. } => ErrorResponse::with_details(
                code,
                "The billing provider is unavailable",
                serde_json::json!({ "retryable": retryable }),
            ),
            BillingError::Persistence(_) => {
                ErrorResponse::new(code, "An internal error occurred")
            }
            _ => ErrorResponse::new(code, self.0.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "Billing request failed");
        }
        (status, Json(body)).into_response()
    }
}

/// API error type for webhook intake.
#[derive(Debug)]
pub struct WebhookApiError(WebhookError);

impl From<WebhookError> for WebhookApiError {
    fn from(err: WebhookError) -> Self {
        Self(err)
    }
}

impl IntoResponse for WebhookApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.0.status_code();
        let code = match &self.0 {
            WebhookError::InvalidSignature | WebhookError::TimestampOutOfRange => {
                ErrorCode::InvalidSignature
            }
            WebhookError::InvalidTimestamp
            | WebhookError::ParseError(_)
            | WebhookError::MissingField(_)
            | WebhookError::UnknownPrice(_) => ErrorCode::ValidationFailed,
            WebhookError::DuplicateEvent => ErrorCode::DuplicateEvent,
            WebhookError::StaleEvent => ErrorCode::StaleEvent,
            WebhookError::SubscriptionNotFound(_) => ErrorCode::SubscriptionNotFound,
            WebhookError::Persistence(_) => ErrorCode::DatabaseError,
        };

        match status {
            s if s.is_server_error() => {
                tracing::warn!(error = %self.0, "Webhook left for redelivery")
            }
            s if s.is_client_error() => {
                tracing::warn!(error = %self.0, "Webhook rejected")
            }
            _ => {}
        }

        let body = ErrorResponse::with_details(
            code.to_string(),
            self.0.to_string(),
            serde_json::json!({ "retryable": self.0.is_retryable() }),
        );
        (status, Json(body)).into_response()
    }
}
