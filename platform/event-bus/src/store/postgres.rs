//! Postgres store
//!
//! Entities live as JSONB documents; filters use `@>` containment. Every
//! conditional write is a single statement or one transaction, so several
//! service instances can share the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::{EntityStore, StoreError};
use crate::dlq::{DeadLetter, DeadLetterSink};
use crate::idempotency::{ClaimOutcome, IdempotencyGuard};
use crate::outbox::{Mutation, OutboxRecord, OutboxStatus, OutboxStore};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    event_id: Uuid,
    envelope: Value,
    status: String,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
    claimed_until: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = match row.status.as_str() {
            "PENDING" => OutboxStatus::Pending,
            "PUBLISHED" => OutboxStatus::Published,
            other => {
                return Err(StoreError::Serialization(format!(
                    "unknown outbox status {other}"
                )))
            }
        };

        Ok(OutboxRecord {
            event_id: row.event_id,
            envelope: serde_json::from_value(row.envelope)?,
            status,
            created_at: row.created_at,
            published_at: row.published_at,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            claimed_until: row.claimed_until,
        })
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool sized from `DB_MAX_CONNECTIONS` / `DB_ACQUIRE_TIMEOUT_SECS`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);

        let acquire_timeout_secs = std::env::var("DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
            .connect(database_url)
            .await?;

        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./db/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        collection: &str,
        filter: &Value,
        document: Value,
    ) -> Result<(), StoreError> {
        // Serialize writers on the same (collection, filter) so two upserts cannot both insert
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || $2::jsonb::text))")
            .bind(collection)
            .bind(filter)
            .execute(&mut **tx)
            .await?;

        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET body = $3, updated_at = NOW()
            WHERE id = (
                SELECT id FROM documents
                WHERE collection = $1 AND body @> $2
                ORDER BY id
                LIMIT 1
            )
            "#,
        )
        .bind(collection)
        .bind(filter)
        .bind(&document)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query("INSERT INTO documents (collection, body) VALUES ($1, $2)")
                .bind(collection)
                .bind(&document)
                .execute(&mut **tx)
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn upsert(&self, collection: &str, filter: &Value, document: Value) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_in_tx(&mut tx, collection, filter, document).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Value>, StoreError> {
        let body = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT body FROM documents
            WHERE collection = $1 AND body @> $2
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(collection)
        .bind(filter)
        .fetch_optional(&self.pool)
        .await?;

        Ok(body)
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn commit(&self, mutation: Mutation, record: OutboxRecord) -> Result<bool, StoreError> {
        let envelope = serde_json::to_value(&record.envelope)?;
        let mut tx = self.pool.begin().await?;

        for write in mutation.into_writes() {
            Self::upsert_in_tx(&mut tx, &write.collection, &write.filter, write.document).await?;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO events_outbox (event_id, event_type, envelope, status, created_at)
            VALUES ($1, $2, $3, 'PENDING', $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(record.event_id)
        .bind(record.envelope.event_type().as_str())
        .bind(envelope)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn claim_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            UPDATE events_outbox
            SET claimed_until = NOW() + make_interval(secs => $3)
            WHERE event_id IN (
                SELECT event_id FROM events_outbox
                WHERE status = 'PENDING'
                  AND created_at <= $1
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING event_id, envelope, status, created_at, published_at,
                      attempts, last_error, claimed_until
            "#,
        )
        .bind(created_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .into_iter()
            .map(OutboxRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.created_at);

        Ok(records)
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events_outbox
            SET status = 'PUBLISHED', published_at = NOW(), claimed_until = NULL
            WHERE event_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(&self, event_id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE events_outbox
            SET attempts = attempts + 1, last_error = $2, claimed_until = NULL
            WHERE event_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_published(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM events_outbox WHERE status = 'PUBLISHED' AND published_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_record(&self, event_id: Uuid) -> Result<Option<OutboxRecord>, StoreError> {
        let row = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT event_id, envelope, status, created_at, published_at,
                   attempts, last_error, claimed_until
            FROM events_outbox
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxRecord::try_from).transpose()
    }
}

#[async_trait]
impl IdempotencyGuard for PgStore {
    async fn already_processed(&self, consumer_id: &str, event_id: Uuid) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events
                WHERE consumer_id = $1 AND event_id = $2 AND status = 'PROCESSED'
            )
            "#,
        )
        .bind(consumer_id)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn claim(
        &self,
        consumer_id: &str,
        event_id: Uuid,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_events (consumer_id, event_id, status, claimed_until)
            VALUES ($1, $2, 'CLAIMED', NOW() + make_interval(secs => $3))
            ON CONFLICT (consumer_id, event_id) DO UPDATE
                SET claimed_until = EXCLUDED.claimed_until
                WHERE processed_events.status = 'CLAIMED'
                  AND processed_events.claimed_until < NOW()
            "#,
        )
        .bind(consumer_id)
        .bind(event_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM processed_events WHERE consumer_id = $1 AND event_id = $2",
        )
        .bind(consumer_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        // A row released between the two statements reads as in progress;
        // the redelivery claims it.
        Ok(match status.as_deref() {
            Some("PROCESSED") => ClaimOutcome::AlreadyProcessed,
            _ => ClaimOutcome::InProgress,
        })
    }

    async fn mark_processed(&self, consumer_id: &str, event_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (consumer_id, event_id, status)
            VALUES ($1, $2, 'PROCESSED')
            ON CONFLICT (consumer_id, event_id) DO UPDATE
                SET status = 'PROCESSED', claimed_until = NULL, processed_at = NOW()
                WHERE processed_events.status = 'CLAIMED'
            "#,
        )
        .bind(consumer_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, consumer_id: &str, event_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM processed_events
            WHERE consumer_id = $1 AND event_id = $2 AND status = 'CLAIMED'
            "#,
        )
        .bind(consumer_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM processed_events WHERE status = 'PROCESSED' AND processed_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DeadLetterSink for PgStore {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO failed_events
                (consumer_id, queue, event_id, event_type, body, reason, error, delivery_count, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&letter.consumer_id)
        .bind(&letter.queue)
        .bind(letter.event_id)
        .bind(&letter.event_type)
        .bind(&letter.body)
        .bind(letter.reason.as_str())
        .bind(&letter.error)
        .bind(i32::try_from(letter.delivery_count).unwrap_or(i32::MAX))
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
