use std::marker::PhantomData;

use ana::{Finalized, SessionCtx, TrackedOperation, EXPIRATION_CAUSE};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::debug;

/// Execution context of a PostgreSQL session.
///
/// Owns the transaction that locked the tracked row. Whatever the work
/// function writes through [`connection`](Self::connection) commits together
/// with a `Finished` record, and is rolled back if the attempt fails.
pub struct PgContext<P, R> {
    tx: Transaction<'static, Postgres>,
    key: String,
    target: String,
    reference_time: DateTime<Utc>,
    _marker: PhantomData<fn() -> (P, R)>,
}

impl<P, R> PgContext<P, R> {
    pub(crate) async fn open(
        mut tx: Transaction<'static, Postgres>,
        key: &str,
        target: &str,
        reference_time: DateTime<Utc>,
    ) -> Result<Self> {
        sqlx::query("SAVEPOINT ana_operation")
            .execute(&mut *tx)
            .await?;

        Ok(Self {
            tx,
            key: key.to_string(),
            target: target.to_string(),
            reference_time,
            _marker: PhantomData,
        })
    }

    pub fn transaction(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.tx
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    /// Discard the work function's writes and store a `Failed` record.
    async fn persist_failure(self, cause: &str, started_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut tx = self.tx;

        sqlx::query("ROLLBACK TO SAVEPOINT ana_operation")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE ana.tracked_operations
            SET status = 'failed',
                result = NULL,
                error_message = $4,
                error_count = error_count + 1,
                started_at = COALESCE($5, started_at),
                finished_at = NOW(),
                updated_at = NOW()
            WHERE key = $1 AND target = $2 AND reference_time = $3
            "#,
        )
        .bind(&self.key)
        .bind(&self.target)
        .bind(self.reference_time)
        .bind(cause)
        .bind(started_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(key = %self.key, target = %self.target, cause, "stored failed operation");
        Ok(())
    }
}

#[async_trait]
impl<P, R> SessionCtx<P, R> for PgContext<P, R>
where
    P: Serialize + Send + Sync + 'static,
    R: Serialize + Send + Sync + 'static,
{
    async fn success(self, operation: TrackedOperation<P, R>) -> Result<Finalized> {
        if operation.is_expired(Utc::now()) {
            self.persist_failure(EXPIRATION_CAUSE, operation.started_at)
                .await?;
            return Ok(Finalized::Vetoed(EXPIRATION_CAUSE.to_string()));
        }

        let result = operation
            .result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let mut tx = self.tx;

        sqlx::query("RELEASE SAVEPOINT ana_operation")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE ana.tracked_operations
            SET status = 'finished',
                result = $4,
                error_message = NULL,
                started_at = COALESCE($5, started_at),
                finished_at = NOW(),
                updated_at = NOW()
            WHERE key = $1 AND target = $2 AND reference_time = $3
            "#,
        )
        .bind(&self.key)
        .bind(&self.target)
        .bind(self.reference_time)
        .bind(result)
        .bind(operation.started_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(key = %self.key, target = %self.target, "stored finished operation");
        Ok(Finalized::Committed)
    }

    async fn fail(self, operation: TrackedOperation<P, R>) -> Result<()> {
        let cause = operation.error.as_deref().unwrap_or("Operation failed");
        self.persist_failure(cause, operation.started_at).await
    }
}
