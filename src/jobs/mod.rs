//! Generalizes the periodic-job abstraction for the index sync timer (spec
//! §4.C incremental sync, §5 concurrency model). Same shape as the
//! fixed-interval background task pattern this crate was built from:
//! `run_job` wraps one pass, `spawn_periodic_job` loops it on its own
//! interval. The addition here is a re-entrancy guard, since incremental
//! sync can also be triggered out of band (e.g. a manual "sync now"
//! command) and the spec requires a tick to be skipped rather than queued
//! if the previous run hasn't finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn interval(&self) -> Duration;

    async fn run_job(&self);
}

/// Spawns a task that runs `job` on its own interval, skipping a tick if
/// the previous run is still in flight.
pub fn spawn_periodic_job<J>(job: Arc<J>) -> tokio::task::JoinHandle<()>
where
    J: PeriodicJob,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(job.interval()).await;
            job.run_job().await;
        }
    })
}

/// Wraps a `PeriodicJob` with a running flag so concurrent callers (the
/// timer loop and a manual trigger) can't overlap.
pub struct ReentrancyGuard<J> {
    inner: J,
    running: AtomicBool,
}

impl<J> ReentrancyGuard<J> {
    pub fn new(inner: J) -> Self {
        Self {
            inner,
            running: AtomicBool::new(false),
        }
    }

    /// Runs the wrapped job unless a run is already in progress. Returns
    /// `false` if the tick was skipped.
    pub async fn try_run(&self) -> bool
    where
        J: PeriodicJob,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("skipping tick, previous run still in progress");
            return false;
        }
        self.inner.run_job().await;
        self.running.store(false, Ordering::SeqCst);
        true
    }
}

#[async_trait]
impl<J: PeriodicJob> PeriodicJob for ReentrancyGuard<J> {
    fn interval(&self) -> Duration {
        self.inner.interval()
    }

    async fn run_job(&self) {
        self.try_run().await;
    }
}
