//! Adapters - Implementations of port interfaces.
//!
//! - `postgres` - Subscription store, event ledger and lead counts
//! - `memory` - In-memory stores for tests and local runs
//! - `stripe` - Stripe REST client and a scriptable mock
//! - `events` - Change notification publishers
//! - `http` - Axum routes

pub mod events;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod stripe;
