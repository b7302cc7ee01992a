//! Application configuration module
//!
//! Type-safe configuration loading from environment variables using the
//! `config` and `dotenvy` crates. Variables carry the `PRACTICE_BILLING`
//! prefix and nested values are separated by double underscores.
//!
//! # Example
//!
//! ```no_run
//! use practice_billing::config::AppConfig;
//!
//! let config = AppConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//! ```

mod billing;
mod database;
mod error;
mod payment;
mod server;

pub use billing::BillingConfig;
pub use database::DatabaseConfig;
pub use error::{ConfigError, ValidationError};
pub use payment::PaymentConfig;
pub use server::{Environment, ServerConfig};

use serde::Deserialize;

/// Root application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port, environment, logging)
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration (PostgreSQL connection)
    pub database: DatabaseConfig,

    /// Payment configuration (Stripe keys, prices, redirects)
    pub payment: PaymentConfig,

    /// Grace period, timeouts and reconciliation schedule
    #[serde(default)]
    pub billing: BillingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` if present, then reads variables with the
    /// `PRACTICE_BILLING` prefix:
    ///
    /// - `PRACTICE_BILLING__SERVER__PORT=8080` -> `server.port = 8080`
    /// - `PRACTICE_BILLING__BILLING__GRACE_PERIOD_DAYS=7` -> `billing.grace_period_days = 7`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or values
    /// cannot be parsed into the expected types.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("PRACTICE_BILLING")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for the first section that is invalid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        self.database.validate()?;
        self.payment.validate(self.is_production())?;
        self.billing.validate()?;
        Ok(())
    }

    /// Check if running in production environment
    pub fn is_production(&self) -> bool {
        self.server.is_production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Env vars are process-global
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const MINIMAL_ENV: &[(&str, &str)] = &[
        ("PRACTICE_BILLING__DATABASE__URL", "postgresql://test@localhost/billing"),
        ("PRACTICE_BILLING__PAYMENT__STRIPE_API_KEY", "sk_test_xxx"),
        ("PRACTICE_BILLING__PAYMENT__STRIPE_WEBHOOK_SECRET", "whsec_xxx"),
        ("PRACTICE_BILLING__PAYMENT__STARTER_MONTHLY_PRICE_ID", "price_starter_m"),
        ("PRACTICE_BILLING__PAYMENT__STARTER_ANNUAL_PRICE_ID", "price_starter_y"),
        ("PRACTICE_BILLING__PAYMENT__PROFESSIONAL_MONTHLY_PRICE_ID", "price_pro_m"),
        ("PRACTICE_BILLING__PAYMENT__PROFESSIONAL_ANNUAL_PRICE_ID", "price_pro_y"),
        ("PRACTICE_BILLING__PAYMENT__ELITE_MONTHLY_PRICE_ID", "price_elite_m"),
        ("PRACTICE_BILLING__PAYMENT__ELITE_ANNUAL_PRICE_ID", "price_elite_y"),
        ("PRACTICE_BILLING__PAYMENT__SUCCESS_URL", "https://app.example.com/billing/success"),
        ("PRACTICE_BILLING__PAYMENT__CANCEL_URL", "https://app.example.com/billing/cancel"),
    ];

    const OPTIONAL_ENV: &[&str] = &[
        "PRACTICE_BILLING__SERVER__PORT",
        "PRACTICE_BILLING__SERVER__ENVIRONMENT",
        "PRACTICE_BILLING__BILLING__GRACE_PERIOD_DAYS",
    ];

    fn set_minimal_env() {
        for (key, value) in MINIMAL_ENV {
            env::set_var(key, value);
        }
    }

    fn clear_env() {
        for (key, _) in MINIMAL_ENV {
            env::remove_var(key);
        }
        for key in OPTIONAL_ENV {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_load_from_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        let result = AppConfig::load();
        clear_env();

        assert!(result.is_ok(), "Failed to load config: {:?}", result.err());
        let config = result.unwrap();
        assert_eq!(config.database.url, "postgresql://test@localhost/billing");
        assert_eq!(config.payment.professional_annual_price_id, "price_pro_y");
    }

    #[test]
    fn test_validate_full_config() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        let result = AppConfig::load();
        clear_env();

        let config = result.unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_section_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        let result = AppConfig::load();
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.environment, Environment::Development);
        assert_eq!(config.billing.grace_period_days, 7);
        assert_eq!(config.billing.reconcile_interval_secs, 3600);
        assert_eq!(config.payment.api_base_url, "https://api.stripe.com");
        assert!(!config.payment.require_livemode);
    }

    #[test]
    fn test_nested_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        env::set_var("PRACTICE_BILLING__SERVER__PORT", "3000");
        env::set_var("PRACTICE_BILLING__SERVER__ENVIRONMENT", "production");
        env::set_var("PRACTICE_BILLING__BILLING__GRACE_PERIOD_DAYS", "3");
        let result = AppConfig::load();
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.server.port, 3000);
        assert!(config.is_production());
        assert_eq!(config.billing.grace_period(), chrono::Duration::days(3));
    }

    #[test]
    fn test_missing_payment_section_fails() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("PRACTICE_BILLING__DATABASE__URL", "postgresql://test@localhost/billing");
        let result = AppConfig::load();
        clear_env();

        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }
}
