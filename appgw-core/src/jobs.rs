//! Worker-pool job facade.
//!
//! The connection manager hands each inbound frame to the router as a
//! fire-and-forget job; ordering across jobs is not guaranteed. Jobs are
//! expected to capture a `Weak` handle to their owning component and return
//! immediately when the upgrade fails, which is the cooperative cancellation
//! path once a component has announced shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// A type-erased unit of work.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Submits opaque jobs onto a pool with bounded concurrency.
pub trait JobPool: Send + Sync {
    fn submit(&self, job: Job);
}

/// Default number of concurrently running jobs.
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 64;

/// Job pool backed by the tokio runtime.
///
/// Concurrency is bounded with a semaphore: every job is spawned eagerly but
/// waits for a permit before running, so submission never blocks the caller.
pub struct TokioJobPool {
    permits: Option<Arc<Semaphore>>,
}

impl TokioJobPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Some(Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    /// A pool without a concurrency bound.
    pub fn unbounded() -> Self {
        Self { permits: None }
    }
}

impl Default for TokioJobPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_JOBS)
    }
}

impl JobPool for TokioJobPool {
    fn submit(&self, job: Job) {
        match &self.permits {
            Some(permits) => {
                let permits = permits.clone();
                tokio::spawn(async move {
                    // Only fails when the semaphore is closed, which we never do.
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    job.await;
                });
            }
            None => {
                tokio::spawn(job);
            }
        }
    }
}
