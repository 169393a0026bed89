//! PostgreSQL implementation of the ana repository.
//!
//! This crate provides a production-ready PostgreSQL implementation of the
//! [`Repository`] and [`Maintenance`] traits from `ana-core`.
//!
//! # Features
//!
//! - Claim-or-fetch with `INSERT ... ON CONFLICT DO NOTHING` and row locks
//! - Sessions that hold the row lock for the whole run, with the work
//!   function's own writes in the same transaction
//! - A savepoint that discards those writes when the attempt fails
//! - Batched maintenance sweeps with `FOR UPDATE SKIP LOCKED`
//!
//! # Database Schema
//!
//! Created by [`PgRepository::migrate`]:
//!
//! ```sql
//! CREATE TABLE ana.tracked_operations (
//!     key TEXT NOT NULL,
//!     target TEXT NOT NULL,
//!     reference_time TIMESTAMPTZ NOT NULL,
//!
//!     status TEXT NOT NULL
//!         CHECK (status IN ('ready', 'running', 'finished', 'failed')),
//!     payload JSONB NOT NULL,
//!     result JSONB,
//!
//!     -- Failure tracking
//!     error_message TEXT,
//!     error_count INTEGER NOT NULL DEFAULT 0,
//!
//!     -- Lifecycle (NULL deadline = never)
//!     started_at TIMESTAMPTZ,
//!     finished_at TIMESTAMPTZ,
//!     timeout TIMESTAMPTZ,
//!     expiration TIMESTAMPTZ,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     PRIMARY KEY (key, target, reference_time)
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use ana::Manager;
//! use ana_postgres::{PgConfig, PgRepository};
//!
//! let config = PgConfig::from_env()?;
//! let repository = PgRepository::<Order, Receipt>::new(config.connect().await?);
//! repository.migrate().await?;
//!
//! let manager = Manager::new(repository);
//! let receipt = manager.call(&ChargeOrder::new(order)).await?;
//! ```

mod config;
mod context;

pub use config::{ConfigError, PgConfig};
pub use context::PgContext;

use std::marker::PhantomData;

use ana::{
    deadline, ensure_terminal, Maintenance, Operation, OperationStatus, Repository, Session,
    TrackedOperation, EXPIRATION_CAUSE, TIMEOUT_CAUSE,
};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL repository for tracked operations.
///
/// `P` and `R` are stored as JSONB, so they only need serde support.
pub struct PgRepository<P, R> {
    pool: PgPool,
    _marker: PhantomData<fn() -> (P, R)>,
}

impl<P, R> Clone for PgRepository<P, R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _marker: PhantomData,
        }
    }
}

impl<P, R> PgRepository<P, R> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `ana` schema and its table if they are missing.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("failed to run ana migrations")?;
        Ok(())
    }
}

impl<P, R> PgRepository<P, R>
where
    P: DeserializeOwned,
    R: DeserializeOwned,
{
    /// Load a record without locking it.
    pub async fn get(
        &self,
        key: &str,
        target: &str,
        reference_time: DateTime<Utc>,
    ) -> Result<Option<TrackedOperation<P, R>>> {
        let row = sqlx::query(
            r#"
            SELECT key, target, reference_time, status, payload, result,
                   error_message, started_at, timeout, expiration
            FROM ana.tracked_operations
            WHERE key = $1 AND target = $2 AND reference_time = $3
            "#,
        )
        .bind(key)
        .bind(target)
        .bind(reference_time)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tracked_from_row).transpose()
    }
}

#[async_trait]
impl<P, R> Repository for PgRepository<P, R>
where
    P: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Payload = P;
    type Output = R;
    type Context = PgContext<P, R>;

    /// Claim the identity, or lock and arbitrate the existing row.
    async fn fetch_or_start<O>(&self, operation: &O) -> Result<Option<TrackedOperation<P, R>>>
    where
        O: Operation<Self::Context, Payload = Self::Payload, Output = Self::Output>,
    {
        let now = Utc::now();
        let reference_time = operation.reference_time();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ana.tracked_operations
                (key, target, reference_time, status, payload, started_at, timeout, expiration)
            VALUES ($1, $2, $3, 'ready', $4, $5, $6, $7)
            ON CONFLICT (key, target, reference_time) DO NOTHING
            "#,
        )
        .bind(operation.key())
        .bind(operation.target())
        .bind(reference_time)
        .bind(serde_json::to_value(operation.payload())?)
        .bind(now)
        .bind(deadline(reference_time, operation.timeout()))
        .bind(deadline(reference_time, operation.expiration()))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 1 {
            tx.commit().await?;
            debug!(
                key = operation.key(),
                target = operation.target(),
                "claimed new operation"
            );
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT key, target, reference_time, status, payload, result,
                   error_message, started_at, timeout, expiration
            FROM ana.tracked_operations
            WHERE key = $1 AND target = $2 AND reference_time = $3
            FOR UPDATE
            "#,
        )
        .bind(operation.key())
        .bind(operation.target())
        .bind(reference_time)
        .fetch_one(&mut *tx)
        .await?;

        let mut tracked: TrackedOperation<P, R> = tracked_from_row(&row)?;
        let claim = tracked.claim(now, operation.timeout());

        if claim.changed {
            store_claim(&mut *tx, &tracked).await?;
            debug!(
                key = operation.key(),
                target = operation.target(),
                previous = %claim.view.status,
                "re-claimed tracked operation"
            );
        }

        tx.commit().await?;
        Ok(Some(claim.view))
    }

    /// Mark the attempt `running`, then lock the row for the lifetime of the
    /// session.
    ///
    /// The mark commits on its own, so an attempt whose owner dies is still
    /// visible to the timeout and expiration sweeps.
    async fn new_session<'o, O>(&self, operation: &'o O) -> Result<Session<'o, O, Self::Context>>
    where
        O: Operation<Self::Context, Payload = Self::Payload, Output = Self::Output>,
    {
        let now = Utc::now();
        let started = sqlx::query(
            r#"
            UPDATE ana.tracked_operations
            SET status = 'running',
                result = NULL,
                error_message = NULL,
                started_at = $4,
                timeout = CASE WHEN timeout IS NULL THEN NULL ELSE $5::TIMESTAMPTZ END,
                updated_at = NOW()
            WHERE key = $1 AND target = $2 AND reference_time = $3
            "#,
        )
        .bind(operation.key())
        .bind(operation.target())
        .bind(operation.reference_time())
        .bind(now)
        .bind(deadline(now, operation.timeout()))
        .execute(&self.pool)
        .await?;

        if started.rows_affected() == 0 {
            anyhow::bail!(
                "no tracked operation {} for key {}",
                operation.target(),
                operation.key()
            );
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            SELECT 1
            FROM ana.tracked_operations
            WHERE key = $1 AND target = $2 AND reference_time = $3
            FOR UPDATE
            "#,
        )
        .bind(operation.key())
        .bind(operation.target())
        .bind(operation.reference_time())
        .fetch_optional(&mut *tx)
        .await?
        .with_context(|| {
            format!(
                "no tracked operation {} for key {}",
                operation.target(),
                operation.key()
            )
        })?;

        let context = PgContext::open(
            tx,
            operation.key(),
            operation.target(),
            operation.reference_time(),
        )
        .await?;

        Ok(Session::new(operation, context))
    }
}

/// Maintenance sweeps.
///
/// Rows held by a live session are skipped rather than waited on.
#[async_trait]
impl<P, R> Maintenance for PgRepository<P, R>
where
    P: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    async fn fail_timed_out(&self, count: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH doomed AS (
                SELECT key, target, reference_time
                FROM ana.tracked_operations
                WHERE status = 'running'
                  AND timeout IS NOT NULL
                  AND timeout < $2
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ana.tracked_operations t
            SET status = 'failed',
                result = NULL,
                error_message = $3,
                error_count = t.error_count + 1,
                finished_at = $2,
                updated_at = NOW()
            FROM doomed d
            WHERE t.key = d.key
              AND t.target = d.target
              AND t.reference_time = d.reference_time
            "#,
        )
        .bind(count)
        .bind(Utc::now())
        .bind(TIMEOUT_CAUSE)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn fail_expired(&self, count: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH doomed AS (
                SELECT key, target, reference_time
                FROM ana.tracked_operations
                WHERE status = 'running'
                  AND expiration IS NOT NULL
                  AND expiration < $2
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ana.tracked_operations t
            SET status = 'failed',
                result = NULL,
                error_message = $3,
                error_count = t.error_count + 1,
                finished_at = $2,
                updated_at = NOW()
            FROM doomed d
            WHERE t.key = d.key
              AND t.target = d.target
              AND t.reference_time = d.reference_time
            "#,
        )
        .bind(count)
        .bind(Utc::now())
        .bind(EXPIRATION_CAUSE)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, status: OperationStatus, count: i64) -> Result<u64> {
        ensure_terminal(status)?;

        let result = sqlx::query(
            r#"
            WITH doomed AS (
                SELECT key, target, reference_time
                FROM ana.tracked_operations
                WHERE status = $2
                  AND expiration IS NOT NULL
                  AND expiration < $3
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            DELETE FROM ana.tracked_operations t
            USING doomed d
            WHERE t.key = d.key
              AND t.target = d.target
              AND t.reference_time = d.reference_time
            "#,
        )
        .bind(count)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

async fn store_claim<P, R>(
    conn: &mut PgConnection,
    tracked: &TrackedOperation<P, R>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ana.tracked_operations
        SET status = $4,
            started_at = $5,
            timeout = $6,
            result = NULL,
            error_message = NULL,
            updated_at = NOW()
        WHERE key = $1 AND target = $2 AND reference_time = $3
        "#,
    )
    .bind(&tracked.key)
    .bind(&tracked.target)
    .bind(tracked.reference_time)
    .bind(tracked.status.as_str())
    .bind(tracked.started_at)
    .bind(tracked.timeout)
    .execute(conn)
    .await?;

    Ok(())
}

fn tracked_from_row<P, R>(row: &PgRow) -> Result<TrackedOperation<P, R>>
where
    P: DeserializeOwned,
    R: DeserializeOwned,
{
    let status: String = row.try_get("status")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let result: Option<serde_json::Value> = row.try_get("result")?;

    Ok(TrackedOperation {
        status: status.parse()?,
        key: row.try_get("key")?,
        target: row.try_get("target")?,
        payload: serde_json::from_value(payload).context("invalid stored payload")?,
        reference_time: row.try_get("reference_time")?,
        started_at: row.try_get("started_at")?,
        timeout: row.try_get("timeout")?,
        expiration: row.try_get("expiration")?,
        result: result
            .map(serde_json::from_value)
            .transpose()
            .context("invalid stored result")?,
        error: row.try_get("error_message")?,
    })
}
