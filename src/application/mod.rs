//! Application layer - Commands, Queries, and Handlers.
//!
//! Orchestrates domain operations over the ports: checkout, webhook intake,
//! quota queries and the reconciliation sweep.

pub mod context;
pub mod handlers;
pub mod locks;
pub mod reconciliation;

pub use context::{BillingContext, BillingSettings, ContextError, ContextParts};
pub use locks::{SubscriptionGuard, SubscriptionLocks};
pub use reconciliation::{ReconcileReport, ReconcileSettings, ReconciliationJob};
