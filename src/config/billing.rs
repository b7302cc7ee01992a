//! Billing behaviour configuration

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;

/// Timing and sizing knobs for webhook processing, checkout and reconciliation.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Days a PAST_DUE subscription keeps its entitlement
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: u32,

    /// Accepted age of a webhook signature in seconds
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_secs: i64,

    /// Bound on the whole checkout provider interaction
    #[serde(default = "default_checkout_timeout")]
    pub checkout_timeout_secs: u64,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Subscriptions checked against the provider at once
    #[serde(default = "default_reconcile_concurrency")]
    pub reconcile_concurrency: usize,

    /// Ledger rows older than this are pruned after each sweep
    #[serde(default = "default_ledger_retention_days")]
    pub ledger_retention_days: u32,
}

impl BillingConfig {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.grace_period_days))
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn ledger_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.ledger_retention_days))
    }

    /// Validate billing configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.grace_period_days > 60 {
            return Err(ValidationError::OutOfRange("grace_period_days"));
        }
        if self.webhook_tolerance_secs <= 0 || self.webhook_tolerance_secs > 3600 {
            return Err(ValidationError::OutOfRange("webhook_tolerance_secs"));
        }
        if self.checkout_timeout_secs == 0 || self.checkout_timeout_secs > 60 {
            return Err(ValidationError::OutOfRange("checkout_timeout_secs"));
        }
        if self.reconcile_interval_secs < 60 {
            return Err(ValidationError::OutOfRange("reconcile_interval_secs"));
        }
        if self.reconcile_concurrency == 0 || self.reconcile_concurrency > 64 {
            return Err(ValidationError::OutOfRange("reconcile_concurrency"));
        }
        if self.ledger_retention_days == 0 {
            return Err(ValidationError::OutOfRange("ledger_retention_days"));
        }
        Ok(())
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_period_days: default_grace_period_days(),
            webhook_tolerance_secs: default_webhook_tolerance(),
            checkout_timeout_secs: default_checkout_timeout(),
            reconcile_interval_secs: default_reconcile_interval(),
            reconcile_concurrency: default_reconcile_concurrency(),
            ledger_retention_days: default_ledger_retention_days(),
        }
    }
}

fn default_grace_period_days() -> u32 {
    7
}

fn default_webhook_tolerance() -> i64 {
    300
}

fn default_checkout_timeout() -> u64 {
    10
}

fn default_reconcile_interval() -> u64 {
    3600
}

fn default_reconcile_concurrency() -> usize {
    8
}

fn default_ledger_retention_days() -> u32 {
    90
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_config_defaults() {
        let config = BillingConfig::default();
        assert_eq!(config.grace_period(), chrono::Duration::days(7));
        assert_eq!(config.webhook_tolerance_secs, 300);
        assert_eq!(config.checkout_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(3600));
        assert_eq!(config.reconcile_concurrency, 8);
        assert_eq!(config.ledger_retention(), chrono::Duration::days(90));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_grace_period_is_allowed() {
        let config = BillingConfig {
            grace_period_days: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let config = BillingConfig {
            reconcile_concurrency: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::OutOfRange("reconcile_concurrency"))
        );

        let config = BillingConfig {
            webhook_tolerance_secs: -1,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::OutOfRange("webhook_tolerance_secs"))
        );

        let config = BillingConfig {
            reconcile_interval_secs: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
