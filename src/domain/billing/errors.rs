//! Billing error taxonomy surfaced to callers.
//!
//! # HTTP Status Mapping
//!
//! | Error | HTTP Status |
//! |-------|-------------|
//! | AuthenticationRequired | 401 |
//! | UnknownTier | 400 |
//! | FreeTierNotPurchasable | 400 |
//! | Validation | 400 |
//! | QuotaExceeded | 429 |
//! | BillingProvider (retryable) | 503 |
//! | BillingProvider (permanent) | 502 |
//! | Persistence | 500 |
//!
//! Webhook-specific failures live in [`WebhookError`](super::WebhookError).

use thiserror::Error;

use crate::domain::foundation::{DomainError, ErrorCode, ValidationError};

/// Errors from the checkout, quota and query operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    #[error("Authentication is required")]
    AuthenticationRequired,

    #[error("Unknown tier '{0}'")]
    UnknownTier(String),

    #[error("The free tier cannot be purchased")]
    FreeTierNotPurchasable,

    #[error("Billing provider error: {message}")]
    BillingProvider { message: String, retryable: bool },

    #[error("Lead quota exceeded ({used} of {limit} used)")]
    QuotaExceeded { used: u64, limit: u32 },

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },
}

impl BillingError {
    pub fn unknown_tier(tier: impl Into<String>) -> Self {
        BillingError::UnknownTier(tier.into())
    }

    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        BillingError::BillingProvider {
            message: message.into(),
            retryable,
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        BillingError::Persistence(message.into())
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        BillingError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns the error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            BillingError::AuthenticationRequired => ErrorCode::AuthenticationRequired,
            BillingError::UnknownTier(_) => ErrorCode::UnknownTier,
            BillingError::FreeTierNotPurchasable => ErrorCode::FreeTierNotPurchasable,
            BillingError::BillingProvider { .. } => ErrorCode::BillingProviderError,
            BillingError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            BillingError::Persistence(_) => ErrorCode::DatabaseError,
            BillingError::Validation { .. } => ErrorCode::ValidationFailed,
        }
    }

    /// True if the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::BillingProvider { retryable, .. } => *retryable,
            BillingError::Persistence(_) => true,
            _ => false,
        }
    }
}

impl From<DomainError> for BillingError {
    fn from(err: DomainError) -> Self {
        match err.code {
            ErrorCode::ValidationFailed => {
                let field = err
                    .details
                    .get("field")
                    .cloned()
                    .unwrap_or_else(|| "request".to_string());
                BillingError::validation(field, err.message)
            }
            ErrorCode::UnknownTier => BillingError::UnknownTier(err.message),
            ErrorCode::BillingProviderError => BillingError::provider(err.message, true),
            _ => BillingError::Persistence(err.message),
        }
    }
}

impl From<ValidationError> for BillingError {
    fn from(err: ValidationError) -> Self {
        DomainError::from(err).into()
    }
}
