//! PostgreSQL adapters - Database implementations for repository ports.
//!
//! - `PostgresSubscriptionStore` - Subscriptions plus the processed-event ledger
//! - `PostgresLeadCounter` - Lead counts for quota windows

mod lead_counter;
mod subscription_store;

pub use lead_counter::PostgresLeadCounter;
pub use subscription_store::PostgresSubscriptionStore;
