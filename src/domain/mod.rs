//! Domain layer containing business logic and domain types.
//!
//! # Module Organization
//!
//! - `foundation` - Shared domain primitives (value objects, IDs, errors)
//! - `billing` - Tiers, subscriptions, provider events and lead quotas

pub mod billing;
pub mod foundation;
