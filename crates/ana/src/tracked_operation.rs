//! Durable record of one execution attempt.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a tracked attempt.
///
/// `Ready` and `Running` are in flight. `Finished` and `Failed` are terminal
/// for the attempt, but a `Failed` record may be picked up again by a later
/// call until it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Ready,
    Running,
    Finished,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown operation status: {}", other)),
        }
    }
}

/// Absolute deadline for `reference_time + duration`.
///
/// A zero duration means "never", so it maps to `None` instead of an instant
/// equal to the reference time.
pub fn deadline(reference_time: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    if duration == Duration::zero() {
        return None;
    }

    Some(reference_time + duration)
}

/// The backend-owned state of one `(key, target, reference_time)` attempt.
///
/// `result` is only present on `Finished` records and `error` only on
/// `Failed` ones; the constructors below keep it that way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedOperation<P, R> {
    pub status: OperationStatus,
    pub key: String,
    pub target: String,
    pub payload: P,
    pub reference_time: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// `None` means the attempt never times out.
    pub timeout: Option<DateTime<Utc>>,
    /// `None` means the attempt never expires.
    pub expiration: Option<DateTime<Utc>>,
    pub result: Option<R>,
    pub error: Option<String>,
}

impl<P, R> TrackedOperation<P, R> {
    /// A freshly claimed record that has not started yet.
    pub fn ready(
        key: impl Into<String>,
        target: impl Into<String>,
        payload: P,
        reference_time: DateTime<Utc>,
        timeout: Option<DateTime<Utc>>,
        expiration: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            status: OperationStatus::Ready,
            key: key.into(),
            target: target.into(),
            payload,
            reference_time,
            started_at: None,
            timeout,
            expiration,
            result: None,
            error: None,
        }
    }

    pub fn running(mut self, started_at: DateTime<Utc>) -> Self {
        self.status = OperationStatus::Running;
        self.started_at = Some(started_at);
        self.result = None;
        self.error = None;
        self
    }

    pub fn finished(mut self, result: R) -> Self {
        self.status = OperationStatus::Finished;
        self.result = Some(result);
        self.error = None;
        self
    }

    pub fn failed(mut self, cause: impl Into<String>) -> Self {
        self.status = OperationStatus::Failed;
        self.result = None;
        self.error = Some(cause.into());
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status == OperationStatus::Finished
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration < now)
    }

    /// Running and not yet past its timeout.
    pub fn still_running(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Running
            && self.timeout.map_or(true, |timeout| timeout > now)
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Running && self.timeout.is_some_and(|t| t < now)
    }

    /// Begin an attempt at `now`: `Running`, with the timeout window counted
    /// from `now`.
    ///
    /// A record without a timeout keeps having none, and a zero `timeout`
    /// clears the stored deadline.
    pub fn start(&mut self, now: DateTime<Utc>, timeout: Duration) {
        self.status = OperationStatus::Running;
        self.started_at = Some(now);
        self.timeout = self.timeout.and_then(|_| deadline(now, timeout));
        self.result = None;
        self.error = None;
    }
}

/// What a caller sees after [`TrackedOperation::claim`], and whether the
/// stored record has to be written back.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim<P, R> {
    pub view: TrackedOperation<P, R>,
    pub changed: bool,
}

impl<P: Clone, R: Clone> TrackedOperation<P, R> {
    /// Claim arbitration for a caller that found this record already stored.
    ///
    /// - `Ready` belongs to whoever created it: promote to `Running`, with the
    ///   timeout window counted from the owner's start, and report that so the
    ///   caller backs off.
    /// - `Failed`, or `Running` past its timeout, and not expired: this caller
    ///   takes it over. The record restarts as `Running` with a fresh timeout
    ///   window and the caller gets the pre-claim view, which the manager
    ///   classifies as retryable.
    /// - Anything else is reported unchanged.
    pub fn claim(&mut self, now: DateTime<Utc>, timeout: Duration) -> Claim<P, R> {
        if self.status == OperationStatus::Ready {
            let started_at = self.started_at.unwrap_or(now);
            self.start(started_at, timeout);
            return Claim {
                view: self.clone(),
                changed: true,
            };
        }

        let reclaimable = !self.is_expired(now)
            && (self.status == OperationStatus::Failed || self.is_timed_out(now));

        if !reclaimable {
            return Claim {
                view: self.clone(),
                changed: false,
            };
        }

        let view = self.clone();
        self.start(now, timeout);

        Claim {
            view,
            changed: true,
        }
    }
}
