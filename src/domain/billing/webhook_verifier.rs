//! Stripe webhook signature verification.
//!
//! HMAC-SHA256 over `"{timestamp}.{raw body}"`, compared in constant time,
//! with the signature timestamp required to lie within a tolerance window
//! in either direction.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::webhook_errors::WebhookError;
use crate::domain::foundation::Timestamp;

/// Default tolerance for signature timestamps.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Parsed components from the Stripe-Signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// All `v1` signatures. Stripe sends several while a secret is rolled.
    pub v1_signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    /// Parses `t=<timestamp>,v1=<hex>[,v1=<hex>...]`. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// `ParseError` if the header is malformed.
    pub fn parse(header: &str) -> Result<Self, WebhookError> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signatures = Vec::new();

        for part in header.split(',') {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or_else(|| WebhookError::ParseError("invalid header format".to_string()))?;

            match key {
                "t" => {
                    timestamp = Some(value.parse().map_err(|_| {
                        WebhookError::ParseError("invalid timestamp".to_string())
                    })?);
                }
                "v1" => {
                    v1_signatures.push(hex::decode(value).map_err(|_| {
                        WebhookError::ParseError("invalid v1 signature hex".to_string())
                    })?);
                }
                _ => {}
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| WebhookError::ParseError("missing timestamp".to_string()))?;
        if v1_signatures.is_empty() {
            return Err(WebhookError::ParseError("missing v1 signature".to_string()));
        }

        Ok(SignatureHeader {
            timestamp,
            v1_signatures,
        })
    }
}

/// Verifier for Stripe webhook signatures.
pub struct StripeWebhookVerifier {
    secret: SecretString,
    tolerance_secs: i64,
}

impl StripeWebhookVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Verifies against the current time.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<(), WebhookError> {
        self.verify_at(payload, signature_header, Timestamp::now())
    }

    /// Verifies the signature as of `now`.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` - header unusable or no signature matches
    /// - `TimestampOutOfRange` - signed too long ago
    /// - `InvalidTimestamp` - signed too far in the future
    pub fn verify_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: Timestamp,
    ) -> Result<(), WebhookError> {
        let header =
            SignatureHeader::parse(signature_header).map_err(|_| WebhookError::InvalidSignature)?;

        self.validate_timestamp(header.timestamp, now.as_unix_secs())?;

        let expected = self.compute_signature(header.timestamp, payload)?;
        let matched = header
            .v1_signatures
            .iter()
            .any(|candidate| constant_time_compare(&expected, candidate));
        if !matched {
            return Err(WebhookError::InvalidSignature);
        }
        Ok(())
    }

    fn validate_timestamp(&self, timestamp: i64, now: i64) -> Result<(), WebhookError> {
        let age = now - timestamp;
        if age > self.tolerance_secs {
            return Err(WebhookError::TimestampOutOfRange);
        }
        if age < -self.tolerance_secs {
            return Err(WebhookError::InvalidTimestamp);
        }
        Ok(())
    }

    fn compute_signature(&self, timestamp: i64, payload: &[u8]) -> Result<Vec<u8>, WebhookError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| WebhookError::InvalidSignature)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Constant-time comparison of two byte slices.
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Computes a `Stripe-Signature` header for test fixtures.
#[cfg(test)]
pub fn compute_test_signature(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key");
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
