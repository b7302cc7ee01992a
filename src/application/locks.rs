//! Per-subscription mutual exclusion.
//!
//! Webhook processing and reconciliation both read-modify-write a single
//! subscription. Each provider subscription id gets its own async mutex so
//! different subscriptions never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Entries beyond this count trigger a sweep of idle locks.
const PRUNE_THRESHOLD: usize = 1024;

/// Held lock on one subscription. Released on drop.
pub type SubscriptionGuard = OwnedMutexGuard<()>;

/// Registry of async mutexes keyed by provider subscription id.
#[derive(Default)]
pub struct SubscriptionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SubscriptionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.registry();
        if locks.len() >= PRUNE_THRESHOLD {
            prune_idle(&mut locks);
        }
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits until the subscription is free.
    pub async fn acquire(&self, provider_subscription_id: &str) -> SubscriptionGuard {
        self.entry(provider_subscription_id).lock_owned().await
    }

    /// Returns `None` immediately if the subscription is held.
    pub fn try_acquire(&self, provider_subscription_id: &str) -> Option<SubscriptionGuard> {
        self.entry(provider_subscription_id).try_lock_owned().ok()
    }

    /// Drops entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        prune_idle(&mut self.registry())
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prune_idle(locks: &mut HashMap<String, Arc<AsyncMutex<()>>>) -> usize {
    let before = locks.len();
    // The registry's own Arc is the only reference left on an idle entry.
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    before - locks.len()
}
