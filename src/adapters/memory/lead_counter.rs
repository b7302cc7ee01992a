//! In-memory lead store for tests and local development.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::domain::foundation::{DomainError, PractitionerId, Timestamp};
use crate::ports::LeadCounter;

#[derive(Default)]
pub struct InMemoryLeadCounter {
    leads: Mutex<Vec<(PractitionerId, Timestamp)>>,
}

impl InMemoryLeadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a lead created at `created_at`.
    pub fn record_lead(&self, practitioner_id: PractitionerId, created_at: Timestamp) {
        self.leads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((practitioner_id, created_at));
    }
}

#[async_trait]
impl LeadCounter for InMemoryLeadCounter {
    async fn count_leads(
        &self,
        practitioner_id: &PractitionerId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<u64, DomainError> {
        let leads = self
            .leads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(leads
            .iter()
            .filter(|(p, at)| p == practitioner_id && start <= *at && *at < end)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_is_half_open() {
        let counter = InMemoryLeadCounter::new();
        let prac = PractitionerId::new("prac-1").unwrap();
        let start = Timestamp::from_unix_secs(1_000).unwrap();
        let end = Timestamp::from_unix_secs(2_000).unwrap();

        counter.record_lead(prac.clone(), start);
        counter.record_lead(prac.clone(), Timestamp::from_unix_secs(1_500).unwrap());
        counter.record_lead(prac.clone(), end);
        counter.record_lead(PractitionerId::new("prac-2").unwrap(), start);

        assert_eq!(counter.count_leads(&prac, start, end).await.unwrap(), 2);
    }
}
