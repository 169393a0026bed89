//! The caller-supplied unit of work.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// A request to run some work at most once per identity.
///
/// `(key, target)` names the logical request; `reference_time` separates
/// instances that share that pair, so it must be stable across retries of the
/// same request. `C` is the execution context handed out by the backend, e.g.
/// an open database transaction.
///
/// Implementations carry data only: the manager may call the accessors any
/// number of times and `call` at most once per execution.
#[async_trait]
pub trait Operation<C: Send>: Send + Sync {
    /// Request data, persisted with the record.
    type Payload: Clone + Send + Sync;

    /// Successful outcome, persisted and replayed to later callers.
    type Output: Clone + Send + Sync;

    fn key(&self) -> &str;

    fn target(&self) -> &str;

    fn payload(&self) -> &Self::Payload;

    fn reference_time(&self) -> DateTime<Utc>;

    /// How long a running attempt may hold the claim. Zero never times out.
    fn timeout(&self) -> Duration;

    /// How long any attempt is honored. Zero never expires.
    fn expiration(&self) -> Duration;

    /// Run the work. Panics are contained by the session.
    async fn call(&self, ctx: &mut C) -> anyhow::Result<Self::Output>;
}
