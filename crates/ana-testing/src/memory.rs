//! In-memory backend.
//!
//! Records live in a [`DashMap`]; every identity also gets a
//! `tokio::sync::Mutex` that plays the part of the row lock. A session holds
//! it from `new_session` until its finalizer returns, and `fetch_or_start`
//! waits for it, exactly like `SELECT ... FOR UPDATE` would. Sweeps only touch
//! records whose lock they can take without waiting.
//!
//! A lock entry lives only while someone holds or waits on it.

use std::sync::Arc;

use ana::{
    deadline, ensure_terminal, Finalized, Maintenance, Operation, OperationStatus, Repository,
    Session, SessionCtx, TrackedOperation, EXPIRATION_CAUSE, TIMEOUT_CAUSE,
};
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type RecordId = (String, String, DateTime<Utc>);

struct Store<P, R> {
    records: DashMap<RecordId, TrackedOperation<P, R>>,
    locks: DashMap<RecordId, Arc<Mutex<()>>>,
}

impl<P, R> Store<P, R> {
    fn lock_for(&self, id: &RecordId) -> Arc<Mutex<()>> {
        self.locks.entry(id.clone()).or_default().clone()
    }

    fn is_locked(&self, id: &RecordId) -> bool {
        self.locks
            .get(id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Forget the lock of `id` once nobody else holds a handle to it.
    ///
    /// The shard stays write-locked during the check, so no new handle can be
    /// handed out in between.
    fn release(&self, id: &RecordId) {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Process-local repository with the claim and lock semantics of a real one.
pub struct InMemoryRepository<P, R> {
    store: Arc<Store<P, R>>,
}

impl<P, R> Clone for InMemoryRepository<P, R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<P, R> Default for InMemoryRepository<P, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, R> InMemoryRepository<P, R> {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store {
                records: DashMap::new(),
                locks: DashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.store.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.records.is_empty()
    }

    /// Identities with a live lock, held or waited on.
    pub fn locked_identities(&self) -> usize {
        self.store.locks.len()
    }
}

impl<P: Clone, R: Clone> InMemoryRepository<P, R> {
    pub fn get(
        &self,
        key: &str,
        target: &str,
        reference_time: DateTime<Utc>,
    ) -> Option<TrackedOperation<P, R>> {
        let id = (key.to_string(), target.to_string(), reference_time);
        self.store.records.get(&id).map(|record| record.clone())
    }

    /// Seed or overwrite a record.
    pub fn insert(&self, record: TrackedOperation<P, R>) {
        let id = (
            record.key.clone(),
            record.target.clone(),
            record.reference_time,
        );
        self.store.records.insert(id, record);
    }
}

fn record_id<C, O>(operation: &O) -> RecordId
where
    C: Send,
    O: Operation<C>,
{
    (
        operation.key().to_string(),
        operation.target().to_string(),
        operation.reference_time(),
    )
}

#[async_trait]
impl<P, R> Repository for InMemoryRepository<P, R>
where
    P: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    type Payload = P;
    type Output = R;
    type Context = MemoryContext<P, R>;

    async fn fetch_or_start<O>(
        &self,
        operation: &O,
    ) -> anyhow::Result<Option<TrackedOperation<P, R>>>
    where
        O: Operation<Self::Context, Payload = Self::Payload, Output = Self::Output>,
    {
        let id = record_id::<Self::Context, O>(operation);
        let lock = self.store.lock_for(&id);
        let guard = lock.lock().await;
        let now = Utc::now();

        let claimed = match self.store.records.entry(id.clone()) {
            Entry::Vacant(entry) => {
                let reference_time = operation.reference_time();
                let mut record = TrackedOperation::ready(
                    operation.key(),
                    operation.target(),
                    operation.payload().clone(),
                    reference_time,
                    deadline(reference_time, operation.timeout()),
                    deadline(reference_time, operation.expiration()),
                );
                record.started_at = Some(now);
                entry.insert(record);

                debug!(
                    key = operation.key(),
                    target = operation.target(),
                    "claimed new operation"
                );
                None
            }
            Entry::Occupied(mut entry) => {
                let claim = entry.get_mut().claim(now, operation.timeout());
                Some(claim.view)
            }
        };

        drop(guard);
        drop(lock);
        self.store.release(&id);

        Ok(claimed)
    }

    async fn new_session<'o, O>(
        &self,
        operation: &'o O,
    ) -> anyhow::Result<Session<'o, O, Self::Context>>
    where
        O: Operation<Self::Context, Payload = Self::Payload, Output = Self::Output>,
    {
        let id = record_id::<Self::Context, O>(operation);
        let guard = self.store.lock_for(&id).lock_owned().await;
        let context = MemoryContext {
            store: self.store.clone(),
            id,
            guard: Some(guard),
        };

        // Mark the attempt as running so sweeps can reclaim it if it is abandoned.
        let mut record = self.store.records.get_mut(&context.id).with_context(|| {
            format!(
                "no tracked operation {} for key {}",
                operation.target(),
                operation.key()
            )
        })?;
        record.start(Utc::now(), operation.timeout());
        drop(record);

        Ok(Session::new(operation, context))
    }
}

/// Holds the identity's lock until the session finalizes.
pub struct MemoryContext<P, R> {
    store: Arc<Store<P, R>>,
    id: RecordId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<P, R> Drop for MemoryContext<P, R> {
    fn drop(&mut self) {
        self.guard.take();
        self.store.release(&self.id);
    }
}

#[async_trait]
impl<P, R> SessionCtx<P, R> for MemoryContext<P, R>
where
    P: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    async fn success(self, operation: TrackedOperation<P, R>) -> anyhow::Result<Finalized> {
        if operation.is_expired(Utc::now()) {
            self.store
                .records
                .insert(self.id.clone(), operation.failed(EXPIRATION_CAUSE));
            return Ok(Finalized::Vetoed(EXPIRATION_CAUSE.to_string()));
        }

        self.store.records.insert(self.id.clone(), operation);
        Ok(Finalized::Committed)
    }

    async fn fail(self, operation: TrackedOperation<P, R>) -> anyhow::Result<()> {
        self.store.records.insert(self.id.clone(), operation);
        Ok(())
    }
}

#[async_trait]
impl<P, R> Maintenance for InMemoryRepository<P, R>
where
    P: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    async fn fail_timed_out(&self, count: i64) -> anyhow::Result<u64> {
        let now = Utc::now();
        Ok(self.fail_matching(count, TIMEOUT_CAUSE, |record| {
            record.is_timed_out(now)
        }))
    }

    async fn fail_expired(&self, count: i64) -> anyhow::Result<u64> {
        let now = Utc::now();
        Ok(self.fail_matching(count, EXPIRATION_CAUSE, |record| {
            record.status == OperationStatus::Running && record.is_expired(now)
        }))
    }

    async fn delete_expired(&self, status: OperationStatus, count: i64) -> anyhow::Result<u64> {
        ensure_terminal(status)?;
        let now = Utc::now();
        let store = &self.store;

        let doomed: Vec<RecordId> = store
            .records
            .iter()
            .filter(|entry| entry.status == status && entry.is_expired(now))
            .filter(|entry| !store.is_locked(entry.key()))
            .take(batch_limit(count))
            .map(|entry| entry.key().clone())
            .collect();

        let mut deleted = 0;
        for id in doomed {
            let lock = store.lock_for(&id);
            if let Ok(_guard) = lock.try_lock() {
                if store
                    .records
                    .remove_if(&id, |_, record| record.status == status)
                    .is_some()
                {
                    deleted += 1;
                }
            }
            drop(lock);
            store.release(&id);
        }

        Ok(deleted)
    }
}

impl<P, R> InMemoryRepository<P, R> {
    fn fail_matching<F>(&self, count: i64, cause: &str, matches: F) -> u64
    where
        F: Fn(&TrackedOperation<P, R>) -> bool,
    {
        let store = &self.store;

        let candidates: Vec<RecordId> = store
            .records
            .iter()
            .filter(|entry| matches(entry.value()))
            .filter(|entry| !store.is_locked(entry.key()))
            .take(batch_limit(count))
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for id in candidates {
            let lock = store.lock_for(&id);
            // A session that started since the scan owns the record now.
            if let Ok(_guard) = lock.try_lock() {
                if let Some(mut record) = store.records.get_mut(&id) {
                    if matches(record.value()) {
                        record.status = OperationStatus::Failed;
                        record.result = None;
                        record.error = Some(cause.to_string());
                        failed += 1;
                    }
                }
            }
            drop(lock);
            store.release(&id);
        }

        failed
    }
}

fn batch_limit(count: i64) -> usize {
    usize::try_from(count).unwrap_or(0)
}
