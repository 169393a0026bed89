//! Manager - the single entry point for managed calls.
//!
//! The manager holds no state between calls. Everything that decides whether
//! work runs lives in the repository's record for the operation.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::error::AnaError;
use crate::operation::Operation;
use crate::repository::Repository;
use crate::tracked_operation::deadline;

/// Runs operations at most once per identity through a [`Repository`].
#[derive(Debug, Clone)]
pub struct Manager<Repo> {
    repository: Repo,
}

impl<Repo: Repository> Manager<Repo> {
    pub fn new(repository: Repo) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Repo {
        &self.repository
    }

    /// Replay, reject, or run `operation`.
    ///
    /// Returns the stored result of a finished attempt, the result of a fresh
    /// run, or one of: [`AnaError::Expired`], [`AnaError::StillRunning`], the
    /// work function's own failure, [`AnaError::Panic`], or
    /// [`AnaError::Backend`] when storage misbehaves.
    pub async fn call<O>(&self, operation: &O) -> Result<Repo::Output, AnaError>
    where
        O: Operation<Repo::Context, Payload = Repo::Payload, Output = Repo::Output>,
    {
        let now = Utc::now();

        if is_expired_operation::<Repo::Context, O>(operation, now) {
            debug!(
                key = operation.key(),
                target = operation.target(),
                "request expired before reaching the repository"
            );
            return Err(AnaError::expired(operation.target(), operation.key()));
        }

        let tracked = self
            .repository
            .fetch_or_start(operation)
            .await
            .map_err(|e| backend_error::<Repo::Context, O>("fetch_or_start", operation, e))?;

        if let Some(tracked) = tracked {
            let now = Utc::now();
            debug!(
                key = %tracked.key,
                target = %tracked.target,
                status = %tracked.status,
                "found tracked operation"
            );

            if tracked.is_expired(now) {
                return Err(AnaError::expired(&tracked.target, &tracked.key));
            }

            if tracked.is_finished() {
                if let Some(result) = tracked.result {
                    return Ok(result);
                }
            }

            if tracked.still_running(now) {
                return Err(AnaError::still_running(&tracked.target, &tracked.key));
            }
        }

        self.call_operation(operation).await
    }

    async fn call_operation<O>(&self, operation: &O) -> Result<Repo::Output, AnaError>
    where
        O: Operation<Repo::Context, Payload = Repo::Payload, Output = Repo::Output>,
    {
        let mut session = self
            .repository
            .new_session(operation)
            .await
            .map_err(|e| backend_error::<Repo::Context, O>("new_session", operation, e))?;

        session.call().await;
        session
            .close()
            .await
            .map_err(|e| backend_error::<Repo::Context, O>("close", operation, e))?;

        let result = session.into_result();
        info!(
            key = operation.key(),
            target = operation.target(),
            succeeded = result.is_ok(),
            "operation executed"
        );
        result
    }
}

fn is_expired_operation<C, O>(operation: &O, now: DateTime<Utc>) -> bool
where
    C: Send,
    O: Operation<C>,
{
    deadline(operation.reference_time(), operation.expiration())
        .is_some_and(|expiration| expiration < now)
}

fn backend_error<C, O>(step: &str, operation: &O, error: anyhow::Error) -> AnaError
where
    C: Send,
    O: Operation<C>,
{
    error!(
        key = operation.key(),
        target = operation.target(),
        step,
        error = %error,
        "repository failed"
    );
    AnaError::Backend(error.context(format!("{} failed", step)))
}
