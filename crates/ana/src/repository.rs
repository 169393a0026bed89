//! Backend contracts (policy-light).
//!
//! A backend stores [`TrackedOperation`]s, arbitrates claims, and locks a record
//! while a [`Session`] runs. The core only ever talks to storage through these
//! traits.

use async_trait::async_trait;

use crate::operation::Operation;
use crate::session::{Session, SessionCtx};
use crate::tracked_operation::{OperationStatus, TrackedOperation};

/// Claim-or-fetch storage for tracked operations.
#[async_trait]
pub trait Repository: Send + Sync {
    type Payload: Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;
    type Context: SessionCtx<Self::Payload, Self::Output>;

    /// Atomically claim the identity or fetch what is stored for it.
    ///
    /// Of N concurrent first callers for a `(key, target, reference_time)`
    /// exactly one gets `None` and owns the execution; the others see the
    /// created record. A `Ready` record seen by a caller that does not own it
    /// is reported as `Running`.
    async fn fetch_or_start<O>(
        &self,
        operation: &O,
    ) -> anyhow::Result<Option<TrackedOperation<Self::Payload, Self::Output>>>
    where
        O: Operation<Self::Context, Payload = Self::Payload, Output = Self::Output>;

    /// Open a session holding the record's exclusive lock until it is closed.
    async fn new_session<'o, O>(
        &self,
        operation: &'o O,
    ) -> anyhow::Result<Session<'o, O, Self::Context>>
    where
        O: Operation<Self::Context, Payload = Self::Payload, Output = Self::Output>;
}

/// Batch sweeps for abandoned and expired records.
///
/// Each call touches at most `count` rows and returns how many it affected,
/// so callers loop until a batch comes back empty. Concurrent workers must
/// never process the same row twice.
#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Move `Running` records past their timeout to `Failed`.
    async fn fail_timed_out(&self, count: i64) -> anyhow::Result<u64>;

    /// Move `Running` records past their expiration to `Failed`.
    async fn fail_expired(&self, count: i64) -> anyhow::Result<u64>;

    /// Delete expired records with the given terminal status.
    async fn delete_expired(&self, status: OperationStatus, count: i64) -> anyhow::Result<u64>;
}

/// Causes written by the sweeps.
pub const TIMEOUT_CAUSE: &str = "Operation timed out";
pub const EXPIRATION_CAUSE: &str = "Operation expired";

/// Reject sweeps over `Ready` or `Running` records.
pub fn ensure_terminal(status: OperationStatus) -> anyhow::Result<()> {
    if !status.is_terminal() {
        anyhow::bail!("only terminal records can be deleted, got {}", status);
    }
    Ok(())
}
