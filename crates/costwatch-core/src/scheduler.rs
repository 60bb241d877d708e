//! Fixed-interval scheduler
//!
//! Ticks never overlap: the loop awaits each run, and a single-slot guard
//! turns any extra trigger that arrives mid-run into a no-op.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Work executed on every tick
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, now: DateTime<Utc>, cancel: &CancellationToken);
}

/// Runs a [`Job`] every `interval` until cancelled
pub struct Scheduler {
    interval: Duration,
    job: Arc<dyn Job>,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new(interval: Duration, job: Arc<dyn Job>) -> Self {
        Self {
            interval,
            job,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run the job now unless a run is already in progress.
    ///
    /// Returns whether the job ran.
    pub async fn run_once(&self, cancel: &CancellationToken) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(job = self.job.name(), "Previous run still in flight, skipping");
            return false;
        }
        let _guard = InFlight(&self.in_flight);

        self.job.run(Utc::now(), cancel).await;
        true
    }

    /// Tick until `cancel` fires. The first tick runs immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(job = self.job.name(), interval = ?self.interval, "Scheduler started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once(&cancel).await;
                }
            }
        }
        info!(job = self.job.name(), "Scheduler stopped");
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

/// Await `fut` for at most `timeout`, giving up early when `cancel` fires
pub async fn bounded<T, F>(
    operation: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(operation)),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout { operation, after: timeout }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct CountingJob {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self, _now: DateTime<Utc>, _cancel: &CancellationToken) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct GatedJob {
        started: Notify,
        release: Notify,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Job for GatedJob {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn run(&self, _now: DateTime<Utc>, _cancel: &CancellationToken) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
        }
    }

    #[tokio::test]
    async fn overlapping_trigger_is_dropped() {
        let job = Arc::new(GatedJob::default());
        let scheduler = Arc::new(Scheduler::new(Duration::from_secs(30), job.clone()));
        let cancel = CancellationToken::new();

        let first = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run_once(&cancel).await })
        };
        job.started.notified().await;

        assert!(!scheduler.run_once(&cancel).await);

        job.release.notify_one();
        assert!(first.await.unwrap());
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        // the slot is free again
        let second = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run_once(&cancel).await })
        };
        job.started.notified().await;
        job.release.notify_one();
        assert!(second.await.unwrap());
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval_until_cancelled() {
        let job = Arc::new(CountingJob::default());
        let scheduler = Arc::new(Scheduler::new(Duration::from_secs(30), job.clone()));
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        handle.await.unwrap();

        // immediate first tick, then 30s, 60s, 90s
        assert_eq!(job.runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out() {
        let cancel = CancellationToken::new();
        let res: Result<()> = bounded("slow call", Duration::from_secs(1), &cancel, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::Timeout { operation: "slow call", .. })));
    }

    #[tokio::test]
    async fn bounded_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<()> = bounded("call", Duration::from_secs(60), &cancel, async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::Cancelled("call"))));
    }
}
