//! Webhook error types.
//!
//! Status codes decide whether the provider redelivers:
//! 2xx acknowledged, 4xx never retried, 5xx retried.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors that occur during webhook processing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    /// HMAC mismatch or unusable signature header.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Signature timestamp older than the tolerance window.
    #[error("Timestamp out of range")]
    TimestampOutOfRange,

    /// Signature timestamp further in the future than the tolerance window.
    #[error("Invalid timestamp")]
    InvalidTimestamp,

    /// Payload could not be parsed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Required field missing from the payload.
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Price id not present in the tier catalog.
    #[error("Unknown price id '{0}'")]
    UnknownPrice(String),

    /// Event id already in the ledger.
    #[error("Event already processed")]
    DuplicateEvent,

    /// Event older than the subscription's last applied event.
    #[error("Event is stale")]
    StaleEvent,

    /// No subscription for a non-checkout event. The checkout event may not
    /// have landed yet.
    #[error("Subscription '{0}' not found")]
    SubscriptionNotFound(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl WebhookError {
    /// True if the provider should redeliver.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WebhookError::SubscriptionNotFound(_) | WebhookError::Persistence(_)
        )
    }

    /// Signed correctly but unusable. Acknowledged and recorded as malformed.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            WebhookError::ParseError(_) | WebhookError::MissingField(_) | WebhookError::UnknownPrice(_)
        )
    }

    /// Maps the error to an HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::InvalidSignature | WebhookError::TimestampOutOfRange => {
                StatusCode::UNAUTHORIZED
            }

            WebhookError::InvalidTimestamp
            | WebhookError::ParseError(_)
            | WebhookError::MissingField(_)
            | WebhookError::UnknownPrice(_) => StatusCode::BAD_REQUEST,

            // Silent successes
            WebhookError::DuplicateEvent | WebhookError::StaleEvent => StatusCode::OK,

            WebhookError::SubscriptionNotFound(_) | WebhookError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failures_are_unauthorized_and_final() {
        for err in [WebhookError::InvalidSignature, WebhookError::TimestampOutOfRange] {
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
            assert!(!err.is_retryable());
        }
        assert_eq!(
            WebhookError::InvalidTimestamp.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn duplicate_and_stale_are_acknowledged() {
        assert_eq!(WebhookError::DuplicateEvent.status_code(), StatusCode::OK);
        assert_eq!(WebhookError::StaleEvent.status_code(), StatusCode::OK);
        assert!(!WebhookError::DuplicateEvent.is_retryable());
    }

    #[test]
    fn persistence_and_missing_subscription_are_retried() {
        let persistence = WebhookError::Persistence("connection reset".to_string());
        assert!(persistence.is_retryable());
        assert_eq!(persistence.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let missing = WebhookError::SubscriptionNotFound("sub_1".to_string());
        assert!(missing.is_retryable());
        assert_eq!(format!("{}", missing), "Subscription 'sub_1' not found");
    }

    #[test]
    fn payload_problems_are_malformed() {
        assert!(WebhookError::ParseError("bad json".to_string()).is_malformed());
        assert!(WebhookError::MissingField("customer").is_malformed());
        assert!(WebhookError::UnknownPrice("price_x".to_string()).is_malformed());
        assert!(!WebhookError::InvalidSignature.is_malformed());
    }
}
