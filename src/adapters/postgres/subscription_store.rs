//! PostgreSQL implementation of the subscription and ledger ports.
//!
//! `commit_event` runs the ledger insert and the subscription upsert in one
//! transaction. The ledger insert uses `ON CONFLICT DO NOTHING`, so two
//! concurrent deliveries of the same event cannot both write state: the
//! loser sees zero affected rows and rolls back. The subscription write is
//! conditional on the watermark the caller read, so a writer that lost a
//! race for the practitioner's row also rolls back instead of overwriting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::domain::billing::{
    BillingCycle, BillingEvent, EventOutcome, Subscription, SubscriptionStatus, TierId,
};
use crate::domain::foundation::{
    DomainError, ErrorCode, PractitionerId, SubscriptionId, Timestamp,
};
use crate::ports::{
    BillingEventLedger, LedgerInsert, RowVersion, SubscriptionRepository, SubscriptionWrite,
};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, practitioner_id, tier, status, billing_cycle,
    current_period_start, current_period_end,
    provider_customer_id, provider_subscription_id,
    last_applied_event_id, last_applied_event_at,
    pending_tier, cancel_at_period_end, grace_ends_at,
    created_at, updated_at
"#;

/// PostgreSQL-backed subscription store.
#[derive(Clone)]
pub struct PostgresSubscriptionStore {
    pool: PgPool,
}

impl PostgresSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Database row representation of a subscription.
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    practitioner_id: String,
    tier: String,
    status: String,
    billing_cycle: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    provider_customer_id: Option<String>,
    provider_subscription_id: Option<String>,
    last_applied_event_id: Option<String>,
    last_applied_event_at: Option<DateTime<Utc>>,
    pending_tier: Option<String>,
    cancel_at_period_end: bool,
    grace_ends_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = DomainError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: SubscriptionId::from_uuid(row.id),
            practitioner_id: PractitionerId::new(row.practitioner_id).map_err(|e| {
                DomainError::database(format!("Invalid practitioner_id: {}", e))
            })?,
            tier: parse_tier(&row.tier)?,
            status: parse_status(&row.status)?,
            billing_cycle: parse_cycle(&row.billing_cycle)?,
            current_period_start: Timestamp::from_datetime(row.current_period_start),
            current_period_end: Timestamp::from_datetime(row.current_period_end),
            provider_customer_id: row.provider_customer_id,
            provider_subscription_id: row.provider_subscription_id,
            last_applied_event_id: row.last_applied_event_id,
            last_applied_event_at: row.last_applied_event_at.map(Timestamp::from_datetime),
            pending_tier: row.pending_tier.as_deref().map(parse_tier).transpose()?,
            cancel_at_period_end: row.cancel_at_period_end,
            grace_ends_at: row.grace_ends_at.map(Timestamp::from_datetime),
            created_at: Timestamp::from_datetime(row.created_at),
            updated_at: Timestamp::from_datetime(row.updated_at),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BillingEventRow {
    provider_event_id: String,
    event_type: String,
    occurred_at: DateTime<Utc>,
    processed_at: DateTime<Utc>,
    outcome: String,
    provider_subscription_id: Option<String>,
}

impl TryFrom<BillingEventRow> for BillingEvent {
    type Error = DomainError;

    fn try_from(row: BillingEventRow) -> Result<Self, Self::Error> {
        let outcome = EventOutcome::parse(&row.outcome).ok_or_else(|| {
            DomainError::database(format!("Invalid outcome value: {}", row.outcome))
        })?;
        Ok(BillingEvent {
            provider_event_id: row.provider_event_id,
            event_type: row.event_type,
            occurred_at: Timestamp::from_datetime(row.occurred_at),
            processed_at: Timestamp::from_datetime(row.processed_at),
            outcome,
            provider_subscription_id: row.provider_subscription_id,
        })
    }
}

fn parse_tier(s: &str) -> Result<TierId, DomainError> {
    s.parse()
        .map_err(|_| DomainError::database(format!("Invalid tier value: {}", s)))
}

fn parse_cycle(s: &str) -> Result<BillingCycle, DomainError> {
    s.parse()
        .map_err(|_| DomainError::database(format!("Invalid billing_cycle value: {}", s)))
}

fn parse_status(s: &str) -> Result<SubscriptionStatus, DomainError> {
    SubscriptionStatus::parse(s)
        .ok_or_else(|| DomainError::database(format!("Invalid status value: {}", s)))
}

fn map_write_error(e: sqlx::Error, what: &str) -> DomainError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.constraint() == Some("subscriptions_provider_subscription_id_key") {
            return DomainError::new(
                ErrorCode::DatabaseError,
                "Provider subscription id already belongs to another practitioner",
            );
        }
    }
    DomainError::database(format!("Failed to {}: {}", what, e))
}

const UPSERT_SUBSCRIPTION: &str = r#"
    INSERT INTO subscriptions (
        id, practitioner_id, tier, status, billing_cycle,
        current_period_start, current_period_end,
        provider_customer_id, provider_subscription_id,
        last_applied_event_id, last_applied_event_at,
        pending_tier, cancel_at_period_end, grace_ends_at,
        created_at, updated_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
"#;

const UPDATE_ON_CONFLICT: &str = r#"
    ON CONFLICT (practitioner_id) DO UPDATE SET
        tier = EXCLUDED.tier,
        status = EXCLUDED.status,
        billing_cycle = EXCLUDED.billing_cycle,
        current_period_start = EXCLUDED.current_period_start,
        current_period_end = EXCLUDED.current_period_end,
        provider_customer_id = EXCLUDED.provider_customer_id,
        provider_subscription_id = EXCLUDED.provider_subscription_id,
        last_applied_event_id = EXCLUDED.last_applied_event_id,
        last_applied_event_at = EXCLUDED.last_applied_event_at,
        pending_tier = EXCLUDED.pending_tier,
        cancel_at_period_end = EXCLUDED.cancel_at_period_end,
        grace_ends_at = EXCLUDED.grace_ends_at,
        updated_at = EXCLUDED.updated_at
"#;

/// Writes the subscription. With a `read` version the write only lands if
/// the stored row still carries that version. Returns whether a row was
/// written.
async fn upsert_subscription<'e, E>(
    executor: E,
    sub: &Subscription,
    read: Option<&RowVersion>,
) -> Result<bool, DomainError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = match read {
        None => format!("{}{}", UPSERT_SUBSCRIPTION, UPDATE_ON_CONFLICT),
        Some(RowVersion::Absent) => {
            format!("{} ON CONFLICT (practitioner_id) DO NOTHING", UPSERT_SUBSCRIPTION)
        }
        Some(RowVersion::Watermark { .. }) => format!(
            "{}{}{}",
            UPSERT_SUBSCRIPTION,
            UPDATE_ON_CONFLICT,
            r#"
            WHERE subscriptions.last_applied_event_id IS NOT DISTINCT FROM $17
              AND subscriptions.last_applied_event_at IS NOT DISTINCT FROM $18
            "#
        ),
    };

    let mut query = sqlx::query(&sql)
        .bind(sub.id.as_uuid())
        .bind(sub.practitioner_id.as_str())
        .bind(sub.tier.as_str())
        .bind(sub.status.as_str())
        .bind(sub.billing_cycle.as_str())
        .bind(sub.current_period_start.as_datetime())
        .bind(sub.current_period_end.as_datetime())
        .bind(&sub.provider_customer_id)
        .bind(&sub.provider_subscription_id)
        .bind(&sub.last_applied_event_id)
        .bind(sub.last_applied_event_at.map(|t| *t.as_datetime()))
        .bind(sub.pending_tier.map(|t| t.as_str()))
        .bind(sub.cancel_at_period_end)
        .bind(sub.grace_ends_at.map(|t| *t.as_datetime()))
        .bind(sub.created_at.as_datetime())
        .bind(sub.updated_at.as_datetime());
    if let Some(RowVersion::Watermark { event_id, event_at }) = read {
        query = query
            .bind(event_id.clone())
            .bind(event_at.map(|t| *t.as_datetime()));
    }

    let written = query
        .execute(executor)
        .await
        .map_err(|e| map_write_error(e, "upsert subscription"))?
        .rows_affected();

    Ok(written > 0)
}

#[async_trait]
impl SubscriptionRepository for PostgresSubscriptionStore {
    async fn get_current(
        &self,
        practitioner_id: &PractitionerId,
    ) -> Result<Option<Subscription>, DomainError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE practitioner_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(practitioner_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DomainError::database(format!("Failed to load subscription: {}", e)))?;

        row.map(Subscription::try_from).transpose()
    }

    async fn get_by_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>, DomainError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE provider_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DomainError::database(format!("Failed to load subscription: {}", e)))?;

        row.map(Subscription::try_from).transpose()
    }

    async fn upsert(&self, subscription: &Subscription) -> Result<(), DomainError> {
        upsert_subscription(&self.pool, subscription, None).await?;
        Ok(())
    }

    async fn upsert_if_unchanged(
        &self,
        subscription: &Subscription,
        read: &RowVersion,
    ) -> Result<bool, DomainError> {
        upsert_subscription(&self.pool, subscription, Some(read)).await
    }

    async fn list_expired_unconfirmed(
        &self,
        as_of: Timestamp,
    ) -> Result<Vec<Subscription>, DomainError> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status IN ('active', 'past_due')
              AND (current_period_end <= $1 OR grace_ends_at <= $1)
            ORDER BY current_period_end ASC
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(as_of.as_datetime())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            DomainError::database(format!("Failed to list expired subscriptions: {}", e))
        })?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn commit_event(
        &self,
        event: &BillingEvent,
        write: Option<SubscriptionWrite<'_>>,
    ) -> Result<LedgerInsert, DomainError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            DomainError::database(format!("Failed to start transaction: {}", e))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO billing_events (
                provider_event_id, event_type, occurred_at, processed_at,
                outcome, provider_subscription_id
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (provider_event_id) DO NOTHING
            "#,
        )
        .bind(&event.provider_event_id)
        .bind(&event.event_type)
        .bind(event.occurred_at.as_datetime())
        .bind(event.processed_at.as_datetime())
        .bind(event.outcome.as_str())
        .bind(&event.provider_subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| DomainError::database(format!("Failed to record event: {}", e)))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(|e| {
                DomainError::database(format!("Failed to roll back transaction: {}", e))
            })?;
            return Ok(LedgerInsert::AlreadyRecorded);
        }

        if let Some(write) = write {
            if !upsert_subscription(&mut *tx, write.subscription, Some(write.read)).await? {
                tx.rollback().await.map_err(|e| {
                    DomainError::database(format!("Failed to roll back transaction: {}", e))
                })?;
                return Ok(LedgerInsert::Conflict);
            }
        }

        tx.commit().await.map_err(|e| {
            DomainError::database(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(LedgerInsert::Inserted)
    }
}

#[async_trait]
impl BillingEventLedger for PostgresSubscriptionStore {
    async fn find_by_event_id(
        &self,
        provider_event_id: &str,
    ) -> Result<Option<BillingEvent>, DomainError> {
        let row: Option<BillingEventRow> = sqlx::query_as(
            r#"
            SELECT provider_event_id, event_type, occurred_at, processed_at,
                   outcome, provider_subscription_id
            FROM billing_events
            WHERE provider_event_id = $1
            "#,
        )
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DomainError::database(format!("Failed to load event: {}", e)))?;

        row.map(BillingEvent::try_from).transpose()
    }

    async fn knows_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<bool, DomainError> {
        let known: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM billing_events
                WHERE provider_subscription_id = $1 AND outcome = 'applied'
            )
            "#,
        )
        .bind(provider_subscription_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            DomainError::database(format!("Failed to look up subscription events: {}", e))
        })?;

        Ok(known)
    }

    async fn prune_before(&self, cutoff: Timestamp) -> Result<u64, DomainError> {
        let result = sqlx::query("DELETE FROM billing_events WHERE processed_at < $1")
            .bind(cutoff.as_datetime())
            .execute(&self.pool)
            .await
            .map_err(|e| DomainError::database(format!("Failed to prune events: {}", e)))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tier_accepts_storage_values() {
        for tier in TierId::ALL {
            assert_eq!(parse_tier(tier.as_str()).unwrap(), tier);
        }
        assert_eq!(
            parse_tier("gold").unwrap_err().code,
            ErrorCode::DatabaseError
        );
    }

    #[test]
    fn parse_status_rejects_unknown_values() {
        assert_eq!(parse_status("past_due").unwrap(), SubscriptionStatus::PastDue);
        assert!(parse_status("expired").is_err());
    }

    #[test]
    fn parse_cycle_round_trips() {
        for cycle in [BillingCycle::Monthly, BillingCycle::Annual] {
            assert_eq!(parse_cycle(cycle.as_str()).unwrap(), cycle);
        }
    }

    #[test]
    fn row_converts_to_subscription() {
        let now = Utc::now();
        let row = SubscriptionRow {
            id: Uuid::new_v4(),
            practitioner_id: "prac-1".to_string(),
            tier: "professional".to_string(),
            status: "past_due".to_string(),
            billing_cycle: "annual".to_string(),
            current_period_start: now,
            current_period_end: now + chrono::Duration::days(365),
            provider_customer_id: Some("cus_1".to_string()),
            provider_subscription_id: Some("sub_1".to_string()),
            last_applied_event_id: Some("evt_1".to_string()),
            last_applied_event_at: Some(now),
            pending_tier: Some("starter".to_string()),
            cancel_at_period_end: false,
            grace_ends_at: Some(now + chrono::Duration::days(7)),
            created_at: now,
            updated_at: now,
        };

        let sub = Subscription::try_from(row).unwrap();
        assert_eq!(sub.tier, TierId::Professional);
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.billing_cycle, BillingCycle::Annual);
        assert_eq!(sub.pending_tier, Some(TierId::Starter));
    }

    #[test]
    fn row_with_bad_outcome_is_rejected() {
        let now = Utc::now();
        let row = BillingEventRow {
            provider_event_id: "evt_1".to_string(),
            event_type: "invoice.paid".to_string(),
            occurred_at: now,
            processed_at: now,
            outcome: "exploded".to_string(),
            provider_subscription_id: None,
        };
        assert!(BillingEvent::try_from(row).is_err());
    }
}
