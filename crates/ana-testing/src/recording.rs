//! Fixed-record repository and a context that only counts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ana::{Finalized, Operation, Repository, Session, SessionCtx, TrackedOperation};
use async_trait::async_trait;

type Record = TrackedOperation<String, String>;

/// Session context that records finalizations instead of persisting them.
///
/// Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct RecordingContext {
    successes: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<Record>>>,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success_count(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn fail_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Snapshot passed to the most recent finalizer.
    pub fn last(&self) -> Option<Record> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    fn remember(&self, operation: Record) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(operation);
        }
    }
}

#[async_trait]
impl SessionCtx<String, String> for RecordingContext {
    async fn success(self, operation: Record) -> anyhow::Result<Finalized> {
        self.successes.fetch_add(1, Ordering::SeqCst);
        self.remember(operation);
        Ok(Finalized::Committed)
    }

    async fn fail(self, operation: Record) -> anyhow::Result<()> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.remember(operation);
        Ok(())
    }
}

/// Repository whose `fetch_or_start` always reports the same record.
///
/// `StaticRepository::empty()` behaves like a store that has never seen the
/// operation.
#[derive(Debug, Clone, Default)]
pub struct StaticRepository {
    tracked: Option<Record>,
    context: RecordingContext,
}

impl StaticRepository {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_tracked(tracked: Record) -> Self {
        Self {
            tracked: Some(tracked),
            context: RecordingContext::new(),
        }
    }

    /// Shared with every session this repository opens.
    pub fn context(&self) -> &RecordingContext {
        &self.context
    }
}

#[async_trait]
impl Repository for StaticRepository {
    type Payload = String;
    type Output = String;
    type Context = RecordingContext;

    async fn fetch_or_start<O>(&self, _operation: &O) -> anyhow::Result<Option<Record>>
    where
        O: Operation<Self::Context, Payload = Self::Payload, Output = Self::Output>,
    {
        Ok(self.tracked.clone())
    }

    async fn new_session<'o, O>(
        &self,
        operation: &'o O,
    ) -> anyhow::Result<Session<'o, O, Self::Context>>
    where
        O: Operation<Self::Context, Payload = Self::Payload, Output = Self::Output>,
    {
        Ok(Session::new(operation, self.context.clone()))
    }
}
