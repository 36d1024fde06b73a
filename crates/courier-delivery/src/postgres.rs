//! PostgreSQL-backed job queue and dead-letter store.
//!
//! Jobs are stored as JSONB snapshots alongside the columns needed for
//! claiming. Workers claim with `FOR UPDATE SKIP LOCKED` so concurrent
//! claimers never block each other or receive the same job. A claim is a
//! lease: jobs whose worker disappeared become claimable again once the
//! lease expires, which keeps delivery at-least-once across crashes.
//!
//! Timestamps are taken from the injected clock rather than `NOW()` so the
//! database agrees with the rest of the engine about readiness.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{Clock, CoreError, DeadLetterRecord, DeliveryJob, DestinationId, JobId, Result};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::{
    dead_letter::DeadLetterStore,
    queue::{BoxFuture, JobQueue},
};

const MIGRATIONS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS delivery_jobs (
        id UUID PRIMARY KEY,
        destination_id TEXT NOT NULL,
        job JSONB NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        ready_at TIMESTAMPTZ NOT NULL,
        claimed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_delivery_jobs_claim
        ON delivery_jobs (status, ready_at, priority DESC)
    ",
    r"
    CREATE TABLE IF NOT EXISTS dead_letters (
        job_id UUID PRIMARY KEY,
        destination_id TEXT NOT NULL,
        record JSONB NOT NULL,
        failed_at TIMESTAMPTZ NOT NULL,
        requires_manual_intervention BOOLEAN NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_dead_letters_destination
        ON dead_letters (destination_id, failed_at DESC)
    ",
];

/// Creates the queue and dead-letter tables if they do not exist.
///
/// # Errors
///
/// Returns error if any DDL statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("delivery schema migrated");
    Ok(())
}

fn ready_at(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| CoreError::InvalidInput(format!("delay out of range: {delay:?}")))
}

/// Durable queue on PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    claim_lease: Duration,
}

impl PostgresJobQueue {
    /// Creates a queue over an existing pool.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock, claim_lease: Duration::from_secs(300) }
    }

    /// Sets how long a claim stays exclusive before another worker may take
    /// the job over.
    #[must_use]
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl JobQueue for PostgresJobQueue {
    fn enqueue(&self, job: DeliveryJob, delay: Duration) -> BoxFuture<'_, Result<JobId>> {
        Box::pin(async move {
            let ready_at = ready_at(self.clock.now_utc(), delay)?;

            sqlx::query(
                r"
                INSERT INTO delivery_jobs
                    (id, destination_id, job, priority, status, ready_at, created_at)
                VALUES ($1, $2, $3, $4, 'pending', $5, $6)
                ",
            )
            .bind(job.id)
            .bind(job.destination.id.as_str())
            .bind(Json(&job))
            .bind(job.priority)
            .bind(ready_at)
            .bind(job.created_at)
            .execute(&self.pool)
            .await?;

            Ok(job.id)
        })
    }

    fn claim(&self, batch_size: usize) -> BoxFuture<'_, Result<Vec<DeliveryJob>>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let lease_expired_before = chrono::Duration::from_std(self.claim_lease)
                .ok()
                .and_then(|lease| now.checked_sub_signed(lease))
                .ok_or_else(|| CoreError::InvalidInput("claim lease out of range".to_string()))?;
            let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

            let mut tx = self.pool.begin().await?;

            let ids: Vec<Uuid> = sqlx::query_scalar(
                r"
                SELECT id FROM delivery_jobs
                WHERE (status = 'pending' AND ready_at <= $1)
                   OR (status = 'claimed' AND claimed_at < $2)
                ORDER BY priority DESC, ready_at ASC, created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
                ",
            )
            .bind(now)
            .bind(lease_expired_before)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

            if ids.is_empty() {
                tx.rollback().await?;
                return Ok(Vec::new());
            }

            let rows: Vec<(Json<DeliveryJob>,)> = sqlx::query_as(
                r"
                UPDATE delivery_jobs
                SET status = 'claimed', claimed_at = $2
                WHERE id = ANY($1)
                RETURNING job
                ",
            )
            .bind(&ids)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

            tx.commit().await?;

            let mut jobs: Vec<DeliveryJob> = rows.into_iter().map(|(Json(job),)| job).collect();
            jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
            Ok(jobs)
        })
    }

    fn reschedule(&self, job: DeliveryJob, delay: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let ready_at = ready_at(self.clock.now_utc(), delay)?;

            let result = sqlx::query(
                r"
                UPDATE delivery_jobs
                SET job = $2, status = 'pending', ready_at = $3, claimed_at = NULL
                WHERE id = $1
                ",
            )
            .bind(job.id)
            .bind(Json(&job))
            .bind(ready_at)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(CoreError::NotFound(format!("delivery job {} not found", job.id)));
            }
            Ok(())
        })
    }

    fn complete(&self, job_id: JobId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM delivery_jobs WHERE id = $1")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM delivery_jobs WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    fn in_flight_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM delivery_jobs WHERE status = 'claimed'")
                    .fetch_one(&self.pool)
                    .await?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }
}

/// Dead-letter store on PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn store(&self, record: DeadLetterRecord) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO dead_letters
                    (job_id, destination_id, record, failed_at, requires_manual_intervention)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (job_id) DO NOTHING
                ",
            )
            .bind(record.job.id)
            .bind(record.destination_id().as_str())
            .bind(Json(&record))
            .bind(record.failed_at)
            .bind(record.requires_manual_intervention)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn get(&self, job_id: JobId) -> BoxFuture<'_, Result<Option<DeadLetterRecord>>> {
        Box::pin(async move {
            let row: Option<(Json<DeadLetterRecord>,)> =
                sqlx::query_as("SELECT record FROM dead_letters WHERE job_id = $1")
                    .bind(job_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(Json(record),)| record))
        })
    }

    fn records_for(
        &self,
        destination_id: DestinationId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<DeadLetterRecord>>> {
        Box::pin(async move {
            let rows: Vec<(Json<DeadLetterRecord>,)> = sqlx::query_as(
                r"
                SELECT record FROM dead_letters
                WHERE destination_id = $1
                ORDER BY failed_at DESC
                LIMIT $2
                ",
            )
            .bind(destination_id.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

            Ok(rows.into_iter().map(|(Json(record),)| record).collect())
        })
    }

    fn count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
                .fetch_one(&self.pool)
                .await?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }
}
