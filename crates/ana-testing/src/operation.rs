//! Scripted operation for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ana::Operation;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// What [`MockOperation::call`](Operation::call) does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Succeed(String),
    Fail(String),
    Panic(String),
}

/// An operation over `String` payloads and results that works with any
/// execution context.
///
/// Clones share the call counter, so a test can hand copies to concurrent
/// callers and still count real executions.
#[derive(Debug, Clone)]
pub struct MockOperation {
    key: String,
    target: String,
    payload: String,
    reference_time: DateTime<Utc>,
    timeout: Duration,
    expiration: Duration,
    behavior: Behavior,
    delay: Option<std::time::Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockOperation {
    /// `key`/`target`/`payload` identity, referenced now, 5s timeout, 10s expiration.
    pub fn new(behavior: Behavior) -> Self {
        Self {
            key: "key".to_string(),
            target: "target".to_string(),
            payload: "payload".to_string(),
            reference_time: Utc::now(),
            timeout: Duration::seconds(5),
            expiration: Duration::seconds(10),
            behavior,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeeding(result: impl Into<String>) -> Self {
        Self::new(Behavior::Succeed(result.into()))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(Behavior::Fail(message.into()))
    }

    pub fn panicking(message: impl Into<String>) -> Self {
        Self::new(Behavior::Panic(message.into()))
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_reference_time(mut self, reference_time: DateTime<Utc>) -> Self {
        self.reference_time = reference_time;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Sleep this long inside `call`, keeping the claim busy.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times the work function actually ran.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<C: Send> Operation<C> for MockOperation {
    type Payload = String;
    type Output = String;

    fn key(&self) -> &str {
        &self.key
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn payload(&self) -> &String {
        &self.payload
    }

    fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn expiration(&self) -> Duration {
        self.expiration
    }

    async fn call(&self, _ctx: &mut C) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behavior {
            Behavior::Succeed(result) => Ok(result.clone()),
            Behavior::Fail(message) => Err(anyhow::anyhow!("{}", message)),
            Behavior::Panic(message) => panic!("{}", message),
        }
    }
}
