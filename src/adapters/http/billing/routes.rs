//! Axum router configuration for billing endpoints.

use axum::{
    routing::{get, post},
    Router,
};
use http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;

use super::handlers::{
    can_consume, create_checkout, get_quota, get_subscription, handle_stripe_webhook, health,
    list_tiers, require_capacity, BillingAppState, PRACTITIONER_HEADER,
};

/// Practitioner-facing billing routes.
///
/// # Routes
/// - `GET /tiers` - Tier catalog (no auth)
/// - `POST /checkout` - Start hosted checkout
/// - `GET /subscription` - Current subscription
/// - `GET /quota` - Lead usage in the current period
/// - `GET /quota/can-consume` - Whether one more lead fits
/// - `GET /quota/capacity` - 204, or 429 when exhausted
pub fn billing_routes() -> Router<BillingAppState> {
    Router::new()
        .route("/tiers", get(list_tiers))
        .route("/checkout", post(create_checkout))
        .route("/subscription", get(get_subscription))
        .route("/quota", get(get_quota))
        .route("/quota/can-consume", get(can_consume))
        .route("/quota/capacity", get(require_capacity))
}

/// Provider webhooks. Authenticated by signature, not by practitioner.
///
/// # Routes
/// - `POST /stripe` - Stripe event intake
pub fn webhook_routes() -> Router<BillingAppState> {
    Router::new().route("/stripe", post(handle_stripe_webhook))
}

/// Billing module router, suitable for mounting at `/api/billing`.
pub fn billing_router() -> Router<BillingAppState> {
    billing_routes().nest("/webhooks", webhook_routes())
}

/// Complete service: billing API, health probe and the tower-http stack.
pub fn app_router(state: BillingAppState, server: &ServerConfig) -> Router {
    let request_id = HeaderName::from_static("x-request-id");

    let router = Router::new()
        .nest("/api/billing", billing_router())
        .route("/health", get(health))
        .with_state(state)
        .layer(TimeoutLayer::new(server.request_timeout()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid));

    match cors_layer(server) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(server: &ServerConfig) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = server
        .cors_origins_list()
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                header::CONTENT_TYPE,
                HeaderName::from_static("x-practitioner-id"),
            ]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::application::context::test_support::{test_context, TestContext, WEBHOOK_SECRET};
    use crate::domain::billing::compute_test_signature;
    use crate::domain::foundation::Timestamp;
    use crate::ports::PaymentError;

    fn app(ctx: &TestContext) -> Router {
        app_router(
            BillingAppState::from_context(&ctx.context),
            &ServerConfig::default(),
        )
    }

    fn get_as(uri: &str, practitioner: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(id) = practitioner {
            builder = builder.header(PRACTITIONER_HEADER, id);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, practitioner: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(PRACTITIONER_HEADER, practitioner)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn checkout_completed_payload(created: i64) -> String {
        serde_json::json!({
            "id": "evt_http_1",
            "type": "checkout.session.completed",
            "created": created,
            "livemode": false,
            "data": { "object": {
                "id": "cs_http_1",
                "customer": "cus_http",
                "subscription": "sub_http",
                "metadata": {
                    "practitioner_id": "prac-http",
                    "tier": "starter",
                    "billing_cycle": "monthly",
                    "price_id": "price_starter_m"
                }
            } }
        })
        .to_string()
    }

    #[tokio::test]
    async fn health_is_public() {
        let ctx = test_context();
        let response = app(&ctx).oneshot(get_as("/health", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn tiers_are_listed_without_auth() {
        let ctx = test_context();
        let response = app(&ctx)
            .oneshot(get_as("/api/billing/tiers", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let tiers = body["tiers"].as_array().unwrap();
        assert_eq!(tiers.len(), 4);
        assert_eq!(tiers[0]["id"], "free");
        assert_eq!(tiers[0]["purchasable"], false);
    }

    #[tokio::test]
    async fn missing_practitioner_is_unauthorized() {
        let ctx = test_context();
        let response = app(&ctx)
            .oneshot(get_as("/api/billing/quota", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "AUTHENTICATION_REQUIRED");
    }

    #[tokio::test]
    async fn empty_practitioner_header_is_unauthorized() {
        let ctx = test_context();
        let response = app(&ctx)
            .oneshot(get_as("/api/billing/subscription", Some("  ")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn checkout_returns_redirect_url() {
        let ctx = test_context();
        let response = app(&ctx)
            .oneshot(post_json(
                "/api/billing/checkout",
                "prac-http",
                serde_json::json!({ "tier": "professional", "billing_cycle": "annual" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["redirect_url"]
            .as_str()
            .unwrap()
            .starts_with("https://checkout.mock.test/"));
        assert_eq!(body["tier"], "professional");
    }

    #[tokio::test]
    async fn checkout_for_free_tier_is_bad_request() {
        let ctx = test_context();
        let response = app(&ctx)
            .oneshot(post_json(
                "/api/billing/checkout",
                "prac-http",
                serde_json::json!({ "tier": "free" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "FREE_TIER_NOT_PURCHASABLE");
    }

    #[tokio::test]
    async fn checkout_with_bad_cycle_is_validation_error() {
        let ctx = test_context();
        let response = app(&ctx)
            .oneshot(post_json(
                "/api/billing/checkout",
                "prac-http",
                serde_json::json!({ "tier": "starter", "billing_cycle": "weekly" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn provider_outage_is_service_unavailable() {
        let ctx = test_context();
        ctx.provider
            .set_method_error("find_customer", PaymentError::network("connection reset"));

        let response = app(&ctx)
            .oneshot(post_json(
                "/api/billing/checkout",
                "prac-http",
                serde_json::json!({ "tier": "starter" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["details"]["retryable"], true);
    }

    #[tokio::test]
    async fn free_practitioner_has_no_capacity() {
        let ctx = test_context();
        let app = app(&ctx);

        let response = app
            .clone()
            .oneshot(get_as("/api/billing/quota/can-consume", Some("prac-http")))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["allowed"], false);

        let response = app
            .oneshot(get_as("/api/billing/quota/capacity", Some("prac-http")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(response).await["code"], "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn webhook_without_signature_is_unauthorized() {
        let ctx = test_context();
        let request = Request::builder()
            .method("POST")
            .uri("/api/billing/webhooks/stripe")
            .body(Body::from(checkout_completed_payload(1_735_689_600)))
            .unwrap();

        let response = app(&ctx).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ctx.store.event_count(), 0);
    }

    #[tokio::test]
    async fn signed_checkout_webhook_activates_then_duplicates() {
        let ctx = test_context();
        let app = app(&ctx);
        let now = Timestamp::now().as_unix_secs();
        let payload = checkout_completed_payload(now);
        let signature = compute_test_signature(WEBHOOK_SECRET, now, &payload);

        let deliver = || {
            Request::builder()
                .method("POST")
                .uri("/api/billing/webhooks/stripe")
                .header("Stripe-Signature", signature.clone())
                .body(Body::from(payload.clone()))
                .unwrap()
        };

        let response = app.clone().oneshot(deliver()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["received"], true);
        assert_eq!(body["outcome"], "applied");

        let response = app.clone().oneshot(deliver()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["outcome"], "duplicate");

        let response = app
            .oneshot(get_as("/api/billing/subscription", Some("prac-http")))
            .await
            .unwrap();
        let view = json_body(response).await;
        assert_eq!(view["tier"], "starter");
        assert_eq!(view["status"], "active");
        assert_eq!(ctx.events.event_count(), 1);
        assert_eq!(ctx.store.event_count(), 1);
    }
}
