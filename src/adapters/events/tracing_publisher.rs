//! Publisher that writes notifications to the structured log.
//!
//! Used when no downstream consumer is wired; the log line is the
//! notification.

use async_trait::async_trait;

use crate::domain::billing::SubscriptionChanged;
use crate::domain::foundation::DomainError;
use crate::ports::EventPublisher;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

impl TracingEventPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: SubscriptionChanged) -> Result<(), DomainError> {
        tracing::info!(
            event_type = event.event_type(),
            practitioner_id = %event.practitioner_id,
            provider_subscription_id = ?event.provider_subscription_id,
            previous_tier = %event.previous_tier,
            tier = %event.tier,
            previous_status = %event.previous_status,
            status = %event.status,
            source = ?event.source,
            event_id = ?event.event_id,
            "Subscription changed"
        );
        Ok(())
    }
}
