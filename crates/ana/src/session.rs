//! One execution attempt and its single finalization.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::AnaError;
use crate::operation::Operation;
use crate::tracked_operation::{deadline, TrackedOperation};

/// What the backend did with a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    /// The result is durably stored as `Finished`.
    Committed,
    /// The backend refused the success and stored the record as `Failed`.
    Vetoed(String),
}

/// Backend hooks that durably commit or abort one attempt.
///
/// Both hooks consume the context, so a session can finalize at most once.
/// They must not return before the terminal state is persisted; an `Err`
/// means the storage contract is broken.
#[async_trait]
pub trait SessionCtx<P, R>: Send + Sized
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Persist a `Finished` record.
    ///
    /// The backend may veto, for example when the record expired while the
    /// work ran. It then persists the failure itself and returns
    /// [`Finalized::Vetoed`].
    async fn success(self, operation: TrackedOperation<P, R>) -> anyhow::Result<Finalized>;

    /// Persist a `Failed` record, discarding whatever the work wrote.
    async fn fail(self, operation: TrackedOperation<P, R>) -> anyhow::Result<()>;
}

/// Wraps one call of an [`Operation`] and the context it runs in.
///
/// Build with [`Session::new`] from a repository's `new_session`, then
/// [`call`](Session::call) once and [`close`](Session::close). Closing twice
/// is a no-op.
pub struct Session<'o, O, C>
where
    O: Operation<C>,
    C: Send,
{
    operation: &'o O,
    context: Option<C>,
    started_at: Option<DateTime<Utc>>,
    outcome: Option<Result<O::Output, AnaError>>,
}

impl<'o, O, C> Session<'o, O, C>
where
    O: Operation<C>,
    O::Payload: 'static,
    O::Output: 'static,
    C: SessionCtx<O::Payload, O::Output>,
{
    pub fn new(operation: &'o O, context: C) -> Self {
        Self {
            operation,
            context: Some(context),
            started_at: None,
            outcome: None,
        }
    }

    /// Execution context, available until the session is closed.
    pub fn context(&mut self) -> Option<&mut C> {
        self.context.as_mut()
    }

    pub fn is_closed(&self) -> bool {
        self.context.is_none()
    }

    /// Run the operation once, turning a panic into [`AnaError::Panic`].
    pub async fn call(&mut self) {
        let Some(context) = self.context.as_mut() else {
            warn!(
                key = self.operation.key(),
                target = self.operation.target(),
                "session already closed, operation not called"
            );
            return;
        };

        if self.outcome.is_some() {
            return;
        }

        self.started_at = Some(Utc::now());

        let outcome = match AssertUnwindSafe(self.operation.call(context))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(AnaError::Operation(error)),
            Err(panic) => {
                let cause = panic_message(panic.as_ref());
                warn!(
                    key = self.operation.key(),
                    target = self.operation.target(),
                    cause = %cause,
                    "operation panicked"
                );
                Err(AnaError::Panic(cause))
            }
        };

        self.outcome = Some(outcome);
    }

    /// Snapshot handed to the finalizers.
    pub fn tracked_operation(&self) -> TrackedOperation<O::Payload, O::Output> {
        let operation = self.operation;
        let reference_time = operation.reference_time();

        let tracked = TrackedOperation::ready(
            operation.key(),
            operation.target(),
            operation.payload().clone(),
            reference_time,
            deadline(reference_time, operation.timeout()),
            deadline(reference_time, operation.expiration()),
        )
        .running(self.started_at.unwrap_or_else(Utc::now));

        match &self.outcome {
            Some(Ok(result)) => tracked.finished(result.clone()),
            Some(Err(error)) => tracked.failed(error.to_string()),
            None => tracked,
        }
    }

    /// Commit or abort through the context. Only the first close has an effect.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        let Some(context) = self.context.take() else {
            return Ok(());
        };

        if self.outcome.is_none() {
            self.outcome = Some(Err(AnaError::Operation(anyhow::anyhow!(
                "operation was never called"
            ))));
        }

        let snapshot = self.tracked_operation();

        if !snapshot.is_finished() {
            debug!(key = %snapshot.key, target = %snapshot.target, "session failed");
            return context.fail(snapshot).await;
        }

        match context.success(snapshot).await? {
            Finalized::Committed => {
                debug!(
                    key = self.operation.key(),
                    target = self.operation.target(),
                    "session committed"
                );
            }
            Finalized::Vetoed(cause) => {
                warn!(
                    key = self.operation.key(),
                    target = self.operation.target(),
                    cause = %cause,
                    "backend vetoed successful operation"
                );
                self.outcome = Some(Err(AnaError::Vetoed {
                    target: self.operation.target().to_string(),
                    key: self.operation.key().to_string(),
                    cause,
                }));
            }
        }

        Ok(())
    }

    /// The captured outcome. Consumes the session.
    pub fn into_result(mut self) -> Result<O::Output, AnaError> {
        self.outcome.take().unwrap_or_else(|| {
            Err(AnaError::Operation(anyhow::anyhow!(
                "operation was never called"
            )))
        })
    }
}

impl<O, C> Drop for Session<'_, O, C>
where
    O: Operation<C>,
    C: Send,
{
    fn drop(&mut self) {
        if self.context.is_some() {
            warn!(
                key = self.operation.key(),
                target = self.operation.target(),
                "session dropped without being closed"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
