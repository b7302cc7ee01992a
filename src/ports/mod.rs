//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the domain and the outside world. Adapters implement these ports.
//!
//! ## Persistence Ports
//!
//! - `SubscriptionRepository` - Subscription state plus atomic event commit
//! - `BillingEventLedger` - Processed-event lookups and retention
//! - `LeadCounter` - Lead counts for quota windows
//!
//! ## External Service Ports
//!
//! - `PaymentProvider` - Customers, checkout sessions, subscription reads
//! - `EventPublisher` - Best-effort change notifications

mod billing_event_ledger;
mod event_publisher;
mod lead_counter;
mod payment_provider;
mod subscription_repository;

pub use billing_event_ledger::BillingEventLedger;
pub use event_publisher::EventPublisher;
pub use lead_counter::LeadCounter;
pub use payment_provider::{
    CheckoutSession, CreateCheckoutRequest, CreateCustomerRequest, Customer, PaymentError,
    PaymentErrorCode, PaymentProvider, ProviderSubscription,
};
pub use subscription_repository::{
    LedgerInsert, RowVersion, SubscriptionRepository, SubscriptionWrite,
};
