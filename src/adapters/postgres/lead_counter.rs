//! PostgreSQL lead counter.
//!
//! Reads the `leads` table owned by the lead intake service. Billing never
//! writes to it.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::domain::foundation::{DomainError, PractitionerId, Timestamp};
use crate::ports::LeadCounter;

#[derive(Clone)]
pub struct PostgresLeadCounter {
    pool: PgPool,
}

impl PostgresLeadCounter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeadCounter for PostgresLeadCounter {
    async fn count_leads(
        &self,
        practitioner_id: &PractitionerId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<u64, DomainError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM leads
            WHERE practitioner_id = $1
              AND created_at >= $2
              AND created_at < $3
            "#,
        )
        .bind(practitioner_id.as_str())
        .bind(start.as_datetime())
        .bind(end.as_datetime())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DomainError::database(format!("Failed to count leads: {}", e)))?;

        Ok(count.max(0) as u64)
    }
}
