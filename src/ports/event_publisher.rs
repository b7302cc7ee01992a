//! EventPublisher port - Outbound change notifications.
//!
//! Publishing is fire-and-forget from billing's point of view: callers log
//! a failed publish and carry on.

use async_trait::async_trait;

use crate::domain::billing::SubscriptionChanged;
use crate::domain::foundation::DomainError;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: SubscriptionChanged) -> Result<(), DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_publisher_is_object_safe() {
        fn _accepts_dyn(_publisher: &dyn EventPublisher) {}
    }
}
