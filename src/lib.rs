//! Practice Billing - Membership entitlements and billing sync
//!
//! Practitioners buy a membership tier through a hosted Stripe checkout.
//! Provider webhooks drive the subscription state, a periodic job repairs
//! drift, and the quota accountant derives lead allowances from it.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
