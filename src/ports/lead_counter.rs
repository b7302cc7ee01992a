//! Lead counting port.
//!
//! Leads are owned by another part of the system. Billing only needs to
//! count them inside a quota window.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, PractitionerId, Timestamp};

#[async_trait]
pub trait LeadCounter: Send + Sync {
    /// Leads created for `practitioner_id` in `[start, end)`.
    async fn count_leads(
        &self,
        practitioner_id: &PractitionerId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<u64, DomainError>;
}
