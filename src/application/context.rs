//! BillingContext - Everything the service needs, built once at startup.
//!
//! `open` wires the Postgres stores, the Stripe client, the tier catalog and
//! the subscription locks from configuration. `close` stops the
//! reconciliation job and drains the pool. Handlers are built from the
//! context so the HTTP layer and the job share the same locks and ports.

use std::sync::{Arc, Mutex};

use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::adapters::events::TracingEventPublisher;
use crate::adapters::postgres::{PostgresLeadCounter, PostgresSubscriptionStore};
use crate::adapters::stripe::{StripeConfig, StripePaymentAdapter};
use crate::application::handlers::billing::{
    CheckoutSettings, GetSubscriptionHandler, InitiateCheckoutHandler, ListTiersHandler,
    ProcessWebhookHandler, QuotaAccountant, WebhookSettings,
};
use crate::application::reconciliation::{self, ReconcileSettings, ReconciliationJob};
use crate::application::SubscriptionLocks;
use crate::config::{AppConfig, ValidationError};
use crate::domain::billing::{StripeWebhookVerifier, TierCatalog};
use crate::ports::{
    BillingEventLedger, EventPublisher, LeadCounter, PaymentError, PaymentProvider,
    SubscriptionRepository,
};

/// Startup failures.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Payment provider client failed: {0}")]
    PaymentProvider(#[from] PaymentError),
}

/// Per-operation settings derived from configuration.
#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub checkout: CheckoutSettings,
    pub webhook: WebhookSettings,
    pub reconcile: ReconcileSettings,
}

impl BillingSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let billing = &config.billing;
        Self {
            checkout: CheckoutSettings {
                success_url: config.payment.success_url.clone(),
                cancel_url: config.payment.cancel_url.clone(),
                timeout: billing.checkout_timeout(),
            },
            webhook: WebhookSettings {
                grace_period: billing.grace_period(),
                require_livemode: config.payment.require_livemode,
            },
            reconcile: ReconcileSettings {
                interval: billing.reconcile_interval(),
                concurrency: billing.reconcile_concurrency,
                provider_timeout: config.payment.request_timeout(),
                grace_period: billing.grace_period(),
                ledger_retention: billing.ledger_retention(),
            },
        }
    }
}

/// Ports and shared pieces for `BillingContext::from_parts`.
pub struct ContextParts {
    pub repository: Arc<dyn SubscriptionRepository>,
    pub ledger: Arc<dyn BillingEventLedger>,
    pub lead_counter: Arc<dyn LeadCounter>,
    pub payment_provider: Arc<dyn PaymentProvider>,
    pub publisher: Arc<dyn EventPublisher>,
    pub catalog: TierCatalog,
    pub verifier: StripeWebhookVerifier,
    pub settings: BillingSettings,
}

pub struct BillingContext {
    repository: Arc<dyn SubscriptionRepository>,
    ledger: Arc<dyn BillingEventLedger>,
    lead_counter: Arc<dyn LeadCounter>,
    payment_provider: Arc<dyn PaymentProvider>,
    publisher: Arc<dyn EventPublisher>,
    catalog: Arc<TierCatalog>,
    locks: Arc<SubscriptionLocks>,
    verifier: Arc<StripeWebhookVerifier>,
    settings: BillingSettings,
    job: Arc<ReconciliationJob>,
    shutdown: watch::Sender<bool>,
    job_handle: Mutex<Option<JoinHandle<()>>>,
    pool: Option<PgPool>,
}

impl BillingContext {
    /// Connects to Postgres and Stripe and validates the catalog.
    ///
    /// # Errors
    ///
    /// - `Config` - tier catalog or URLs invalid
    /// - `Database` / `Migration` - pool or migrations failed
    /// - `PaymentProvider` - HTTP client could not be built
    pub async fn open(config: &AppConfig) -> Result<Self, ContextError> {
        let catalog = config.payment.catalog()?;

        let pool = config.database.connect().await?;
        if config.database.run_migrations {
            sqlx::migrate!("./migrations").run(&pool).await?;
            tracing::info!("Database migrations applied");
        }

        let stripe = StripePaymentAdapter::new(
            StripeConfig::new(config.payment.stripe_api_key.clone())
                .with_base_url(config.payment.api_base_url.clone())
                .with_timeout(config.payment.request_timeout()),
        )?;

        let verifier = StripeWebhookVerifier::new(config.payment.stripe_webhook_secret.clone())
            .with_tolerance(config.billing.webhook_tolerance_secs);

        let store = Arc::new(PostgresSubscriptionStore::new(pool.clone()));
        let mut context = Self::from_parts(ContextParts {
            repository: store.clone(),
            ledger: store,
            lead_counter: Arc::new(PostgresLeadCounter::new(pool.clone())),
            payment_provider: Arc::new(stripe),
            publisher: Arc::new(TracingEventPublisher::new()),
            catalog,
            verifier,
            settings: BillingSettings::from_config(config),
        });
        context.pool = Some(pool);

        tracing::info!(
            live_mode = config.payment.is_live_mode(),
            migrations = config.database.run_migrations,
            "Billing context opened"
        );
        Ok(context)
    }

    /// Assembles a context from ready-made ports. No pool is owned.
    pub fn from_parts(parts: ContextParts) -> Self {
        let catalog = Arc::new(parts.catalog);
        let locks = Arc::new(SubscriptionLocks::new());
        let job = Arc::new(ReconciliationJob::new(
            parts.repository.clone(),
            parts.ledger.clone(),
            parts.payment_provider.clone(),
            parts.publisher.clone(),
            catalog.clone(),
            locks.clone(),
            parts.settings.reconcile.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            repository: parts.repository,
            ledger: parts.ledger,
            lead_counter: parts.lead_counter,
            payment_provider: parts.payment_provider,
            publisher: parts.publisher,
            catalog,
            locks,
            verifier: Arc::new(parts.verifier),
            settings: parts.settings,
            job,
            shutdown,
            job_handle: Mutex::new(None),
            pool: None,
        }
    }

    pub fn catalog(&self) -> Arc<TierCatalog> {
        self.catalog.clone()
    }

    pub fn locks(&self) -> Arc<SubscriptionLocks> {
        self.locks.clone()
    }

    pub fn settings(&self) -> &BillingSettings {
        &self.settings
    }

    pub fn checkout_handler(&self) -> InitiateCheckoutHandler {
        InitiateCheckoutHandler::new(
            self.repository.clone(),
            self.payment_provider.clone(),
            self.catalog.clone(),
            self.settings.checkout.clone(),
        )
    }

    pub fn webhook_handler(&self) -> ProcessWebhookHandler {
        ProcessWebhookHandler::new(
            self.repository.clone(),
            self.ledger.clone(),
            self.publisher.clone(),
            self.catalog.clone(),
            self.locks.clone(),
            self.verifier.clone(),
            self.settings.webhook.clone(),
        )
    }

    pub fn quota_accountant(&self) -> QuotaAccountant {
        QuotaAccountant::new(
            self.repository.clone(),
            self.lead_counter.clone(),
            self.catalog.clone(),
        )
    }

    pub fn subscription_handler(&self) -> GetSubscriptionHandler {
        GetSubscriptionHandler::new(self.repository.clone())
    }

    pub fn tiers_handler(&self) -> ListTiersHandler {
        ListTiersHandler::new(self.catalog.clone())
    }

    pub fn reconciliation_job(&self) -> Arc<ReconciliationJob> {
        self.job.clone()
    }

    /// Starts the periodic reconciliation job. A second call is a no-op.
    pub fn start_reconciliation(&self) {
        let mut handle = self.job_handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() {
            return;
        }
        *handle = Some(reconciliation::spawn(
            self.job.clone(),
            self.shutdown.subscribe(),
        ));
        tracing::info!(
            interval_secs = self.settings.reconcile.interval.as_secs(),
            "Reconciliation job started"
        );
    }

    /// Stops the job, waits for an in-flight pass, then closes the pool.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .job_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Reconciliation job ended abnormally");
            }
        }
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        tracing::info!("Billing context closed");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::adapters::events::InMemoryEventBus;
    use crate::adapters::memory::{InMemoryLeadCounter, InMemorySubscriptionStore};
    use crate::adapters::stripe::MockPaymentProvider;
    use crate::domain::billing::test_catalog;
    use secrecy::SecretString;
    use std::time::Duration;

    pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

    /// In-memory context plus handles on its fakes.
    pub struct TestContext {
        pub context: BillingContext,
        pub store: Arc<InMemorySubscriptionStore>,
        pub leads: Arc<InMemoryLeadCounter>,
        pub provider: MockPaymentProvider,
        pub events: Arc<InMemoryEventBus>,
    }

    pub fn test_settings() -> BillingSettings {
        BillingSettings {
            checkout: CheckoutSettings {
                success_url: "https://app.test/billing/success".to_string(),
                cancel_url: "https://app.test/billing/cancel".to_string(),
                timeout: Duration::from_secs(5),
            },
            webhook: WebhookSettings::default(),
            reconcile: ReconcileSettings {
                interval: Duration::from_millis(10),
                ..ReconcileSettings::default()
            },
        }
    }

    pub fn test_context() -> TestContext {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let leads = Arc::new(InMemoryLeadCounter::new());
        let provider = MockPaymentProvider::new();
        let events = Arc::new(InMemoryEventBus::new());
        let context = BillingContext::from_parts(ContextParts {
            repository: store.clone(),
            ledger: store.clone(),
            lead_counter: leads.clone(),
            payment_provider: Arc::new(provider.clone()),
            publisher: events.clone(),
            catalog: test_catalog(),
            verifier: StripeWebhookVerifier::new(SecretString::new(WEBHOOK_SECRET.to_string())),
            settings: test_settings(),
        });
        TestContext {
            context,
            store,
            leads,
            provider,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_context;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn handlers_share_one_lock_registry() {
        let ctx = test_context().context;
        let _held = ctx.locks().acquire("sub_shared").await;

        assert!(ctx.locks().try_acquire("sub_shared").is_none());
        assert!(Arc::ptr_eq(&ctx.locks(), &ctx.locks));
    }

    #[tokio::test]
    async fn start_then_close_stops_job() {
        let ctx = test_context().context;
        ctx.start_reconciliation();
        ctx.start_reconciliation();

        tokio::time::sleep(Duration::from_millis(30)).await;
        tokio::time::timeout(Duration::from_secs(1), ctx.close())
            .await
            .unwrap();

        assert!(ctx.job_handle.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn close_without_start_is_fine() {
        let ctx = test_context().context;
        ctx.close().await;
    }

    #[test]
    fn tiers_handler_lists_catalog() {
        let ctx = test_context().context;
        assert_eq!(ctx.tiers_handler().handle().len(), 4);
    }
}
