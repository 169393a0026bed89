//! Reaper - periodic maintenance over a [`Maintenance`] backend.
//!
//! Timed-out and expired `Running` records are failed, then expired terminal
//! records are purged. Every sweep runs in batches until one comes back empty,
//! so several reapers can share a backend.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::repository::Maintenance;
use crate::tracked_operation::OperationStatus;

/// Shortest delay [`Reaper::run`] waits between passes.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Reaper tuning knobs.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Rows per sweep call.
    pub batch_size: i64,
    /// Delay between passes in [`Reaper::run`], raised to
    /// [`MIN_SWEEP_INTERVAL`] when shorter.
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval: Duration::from_secs(60),
        }
    }
}

/// Rows affected by one [`Reaper::sweep_once`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: u64,
    pub expired: u64,
    pub deleted_finished: u64,
    pub deleted_failed: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.timed_out + self.expired + self.deleted_finished + self.deleted_failed
    }
}

pub struct Reaper<M> {
    maintenance: M,
    config: ReaperConfig,
}

impl<M: Maintenance> Reaper<M> {
    pub fn new(maintenance: M, config: ReaperConfig) -> Self {
        Self {
            maintenance,
            config,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Run every sweep to exhaustion once.
    pub async fn sweep_once(&self) -> anyhow::Result<SweepReport> {
        let batch_size = self.config.batch_size;
        let maintenance = &self.maintenance;

        let report = SweepReport {
            timed_out: drain(|| maintenance.fail_timed_out(batch_size)).await?,
            expired: drain(|| maintenance.fail_expired(batch_size)).await?,
            deleted_finished: drain(|| {
                maintenance.delete_expired(OperationStatus::Finished, batch_size)
            })
            .await?,
            deleted_failed: drain(|| {
                maintenance.delete_expired(OperationStatus::Failed, batch_size)
            })
            .await?,
        };

        if report.total() > 0 {
            info!(
                timed_out = report.timed_out,
                expired = report.expired,
                deleted_finished = report.deleted_finished,
                deleted_failed = report.deleted_failed,
                "reaper sweep complete"
            );
        } else {
            debug!("reaper sweep found nothing to do");
        }

        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` resolves.
    ///
    /// A failed pass is logged and retried on the next tick.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.config.interval < MIN_SWEEP_INTERVAL {
            warn!(
                interval_ms = self.config.interval.as_millis() as u64,
                "reaper interval too short, using the minimum"
            );
        }
        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_SWEEP_INTERVAL));

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("reaper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "reaper sweep failed");
                    }
                }
            }
        }
    }
}

async fn drain<F, Fut>(mut sweep: F) -> anyhow::Result<u64>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<u64>>,
{
    let mut total = 0;

    loop {
        let affected = sweep().await?;
        if affected == 0 {
            return Ok(total);
        }
        total += affected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    /// Pretends to hold `pending` rows per sweep and hands them out in batches.
    #[derive(Clone)]
    struct FakeMaintenance {
        timed_out: Arc<AtomicU64>,
        expired: Arc<AtomicU64>,
        finished: Arc<AtomicU64>,
        failed: Arc<AtomicU64>,
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_sweeps: bool,
    }

    impl FakeMaintenance {
        fn new(timed_out: u64, expired: u64, finished: u64, failed: u64) -> Self {
            Self {
                timed_out: Arc::new(AtomicU64::new(timed_out)),
                expired: Arc::new(AtomicU64::new(expired)),
                finished: Arc::new(AtomicU64::new(finished)),
                failed: Arc::new(AtomicU64::new(failed)),
                calls: Arc::new(Mutex::new(Vec::new())),
                fail_sweeps: false,
            }
        }

        fn take(pending: &AtomicU64, count: i64) -> u64 {
            let available = pending.load(Ordering::SeqCst);
            let taken = available.min(count as u64);
            pending.fetch_sub(taken, Ordering::SeqCst);
            taken
        }
    }

    #[async_trait]
    impl Maintenance for FakeMaintenance {
        async fn fail_timed_out(&self, count: i64) -> anyhow::Result<u64> {
            self.calls.lock().unwrap().push("timed_out");
            if self.fail_sweeps {
                anyhow::bail!("database unavailable");
            }
            Ok(Self::take(&self.timed_out, count))
        }

        async fn fail_expired(&self, count: i64) -> anyhow::Result<u64> {
            self.calls.lock().unwrap().push("expired");
            Ok(Self::take(&self.expired, count))
        }

        async fn delete_expired(
            &self,
            status: OperationStatus,
            count: i64,
        ) -> anyhow::Result<u64> {
            match status {
                OperationStatus::Finished => {
                    self.calls.lock().unwrap().push("finished");
                    Ok(Self::take(&self.finished, count))
                }
                OperationStatus::Failed => {
                    self.calls.lock().unwrap().push("failed");
                    Ok(Self::take(&self.failed, count))
                }
                other => anyhow::bail!("unexpected status {}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_sweep_once_drains_in_batches() {
        let maintenance = FakeMaintenance::new(5, 2, 0, 3);
        let reaper = Reaper::new(
            maintenance.clone(),
            ReaperConfig {
                batch_size: 2,
                interval: Duration::from_millis(10),
            },
        );

        let report = reaper.sweep_once().await.unwrap();

        assert_eq!(
            report,
            SweepReport {
                timed_out: 5,
                expired: 2,
                deleted_finished: 0,
                deleted_failed: 3,
            }
        );
        assert_eq!(report.total(), 10);

        // 5 rows at 2 per batch: 2, 2, 1, then an empty batch.
        let calls = maintenance.calls.lock().unwrap().clone();
        assert_eq!(calls.iter().filter(|c| **c == "timed_out").count(), 4);
        assert_eq!(calls.iter().filter(|c| **c == "finished").count(), 1);
        assert_eq!(calls.first(), Some(&"timed_out"));
        assert_eq!(calls.last(), Some(&"failed"));
    }

    #[tokio::test]
    async fn test_sweep_once_propagates_backend_errors() {
        let mut maintenance = FakeMaintenance::new(1, 0, 0, 0);
        maintenance.fail_sweeps = true;
        let reaper = Reaper::new(maintenance, ReaperConfig::default());

        assert!(reaper.sweep_once().await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let maintenance = FakeMaintenance::new(3, 0, 0, 0);
        let reaper = Reaper::new(
            maintenance.clone(),
            ReaperConfig {
                batch_size: 10,
                interval: Duration::from_millis(5),
            },
        );

        reaper
            .run(tokio::time::sleep(Duration::from_millis(30)))
            .await;

        assert_eq!(maintenance.timed_out.load(Ordering::SeqCst), 0);
        assert!(maintenance.calls.lock().unwrap().len() >= 5);
    }

    #[tokio::test]
    async fn test_run_with_zero_interval_still_sweeps() {
        let maintenance = FakeMaintenance::new(2, 0, 0, 0);
        let reaper = Reaper::new(
            maintenance.clone(),
            ReaperConfig {
                batch_size: 10,
                interval: Duration::ZERO,
            },
        );

        reaper
            .run(tokio::time::sleep(Duration::from_millis(10)))
            .await;

        assert_eq!(maintenance.timed_out.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_default_config() {
        let config = ReaperConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.interval, Duration::from_secs(60));
    }
}
