//! In-memory adapters for tests and local development.

mod lead_counter;
mod subscription_store;

pub use lead_counter::InMemoryLeadCounter;
pub use subscription_store::InMemorySubscriptionStore;
