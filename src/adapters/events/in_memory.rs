//! In-memory event bus for tests and local development.
//!
//! Captures every published notification for assertions and can be told to
//! fail, so callers can prove that a failed publish never bubbles up.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::domain::billing::SubscriptionChanged;
use crate::domain::foundation::{DomainError, ErrorCode};
use crate::ports::EventPublisher;

/// In-memory event bus.
///
/// # Example
///
/// ```ignore
/// let bus = Arc::new(InMemoryEventBus::new());
/// handler.handle(cmd).await?;
/// assert_eq!(bus.event_count(), 1);
/// ```
pub struct InMemoryEventBus {
    published: RwLock<Vec<SubscriptionChanged>>,
    fail_publish: AtomicBool,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            published: RwLock::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
        }
    }

    // === Test Helpers ===

    /// Makes every following publish fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published_events(&self) -> Vec<SubscriptionChanged> {
        self.published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn events_for_practitioner(&self, practitioner_id: &str) -> Vec<SubscriptionChanged> {
        self.published_events()
            .into_iter()
            .filter(|e| e.practitioner_id.as_str() == practitioner_id)
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn clear(&self) {
        self.published
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: SubscriptionChanged) -> Result<(), DomainError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(DomainError::new(
                ErrorCode::InternalError,
                "event bus unavailable",
            ));
        }
        self.published
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}
