//! Worker pools sized from the per-node open job bound.
//!
//! Each pool runs a fixed number of workers pulling from a bounded queue.
//! A submission that finds the queue full is rejected with
//! [`PoolError::Saturated`]; nothing is dropped or queued without bound.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pool running one supervision loop per open job.
pub const AUTODETECT_POOL: &str = "ml_autodetect";
/// Pool for short auxiliary work such as persisting results.
pub const UTILITY_POOL: &str = "ml_utility";
/// Pool running one loop per started datafeed.
pub const DATAFEED_POOL: &str = "ml_datafeed";

/// Errors submitting work to a pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool [{pool}] rejected work: queue of {queue_depth} is full")]
    Saturated {
        pool: &'static str,
        queue_depth: usize,
    },

    #[error("pool [{pool}] is shut down")]
    Shutdown { pool: &'static str },
}

// =============================================================================
// Planning
// =============================================================================

/// Size of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: &'static str,
    /// Work items executing at once.
    pub capacity: usize,
    /// Work items waiting for a worker.
    pub queue_depth: usize,
}

/// Sizes of the three ML pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPlan {
    pub autodetect: PoolSpec,
    pub utility: PoolSpec,
    pub datafeed: PoolSpec,
}

impl PoolPlan {
    /// Plan pools for a node allowed `max_open_jobs` open jobs.
    ///
    /// Sizes depend only on the declared bound, never on how many jobs are
    /// currently open.
    pub fn for_max_open_jobs(max_open_jobs: u32) -> Self {
        let n = max_open_jobs as usize;
        Self {
            autodetect: PoolSpec {
                name: AUTODETECT_POOL,
                capacity: 4 * n,
                queue_depth: 4,
            },
            utility: PoolSpec {
                name: UTILITY_POOL,
                capacity: 4 * n,
                queue_depth: 500,
            },
            datafeed: PoolSpec {
                name: DATAFEED_POOL,
                capacity: n,
                queue_depth: 200,
            },
        }
    }

    pub fn specs(&self) -> [PoolSpec; 3] {
        [self.autodetect, self.utility, self.datafeed]
    }
}

// =============================================================================
// Execution
// =============================================================================

type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub queued: usize,
}

/// A fixed-size pool of async workers behind a bounded queue.
pub struct WorkerPool {
    spec: PoolSpec,
    tx: Mutex<Option<mpsc::Sender<Work>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Start the pool's workers. Must be called inside a tokio runtime.
    pub fn start(spec: PoolSpec) -> Self {
        // A zero-capacity channel is not allowed; a zero queue still needs
        // one slot for hand-off to an idle worker.
        let (tx, rx) = mpsc::channel::<Work>(spec.queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(0));

        let workers = (0..spec.capacity)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let active = Arc::clone(&active);
                tokio::spawn(worker_loop(spec.name, worker, rx, active))
            })
            .collect();

        debug!(pool = spec.name, capacity = spec.capacity, queue_depth = spec.queue_depth, "Worker pool started");

        Self {
            spec,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            active,
        }
    }

    pub fn spec(&self) -> PoolSpec {
        self.spec
    }

    /// Submit work without waiting. Fails if the queue is full.
    pub fn try_submit<F>(&self, work: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(PoolError::Shutdown {
                pool: self.spec.name,
            });
        };

        tx.try_send(Box::pin(work)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(pool = self.spec.name, queue_depth = self.spec.queue_depth, "Pool saturated");
                PoolError::Saturated {
                    pool: self.spec.name,
                    queue_depth: self.spec.queue_depth,
                }
            }
            mpsc::error::TrySendError::Closed(_) => PoolError::Shutdown {
                pool: self.spec.name,
            },
        })
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self
            .tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);
        PoolStats {
            active: self.active.load(Ordering::SeqCst),
            queued,
        }
    }

    /// Stop accepting work, let queued and running work finish for up to
    /// `grace`, then abort whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));

        let deadline = tokio::time::Instant::now() + grace;
        for mut worker in workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                warn!(pool = self.spec.name, "Aborting worker after shutdown grace period");
                worker.abort();
            }
        }
        info!(pool = self.spec.name, "Worker pool stopped");
    }
}

async fn worker_loop(
    pool: &'static str,
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Work>>>,
    active: Arc<AtomicUsize>,
) {
    loop {
        let work = { rx.lock().await.recv().await };
        let Some(work) = work else {
            break;
        };

        active.fetch_add(1, Ordering::SeqCst);
        // Run on its own task so a panic does not take the worker down.
        let handle = tokio::spawn(work);
        let _abort = AbortOnDrop(handle.abort_handle());
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(pool, worker, "Pool work panicked");
            }
        }
        active.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(pool, worker, "Pool worker exiting");
}

/// Aborts the running work if its worker is aborted.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The three ML worker pools.
pub struct ThreadPools {
    pub autodetect: WorkerPool,
    pub utility: WorkerPool,
    pub datafeed: WorkerPool,
}

impl ThreadPools {
    pub fn start(plan: &PoolPlan) -> Self {
        info!(
            autodetect = plan.autodetect.capacity,
            utility = plan.utility.capacity,
            datafeed = plan.datafeed.capacity,
            "Starting ML worker pools"
        );
        Self {
            autodetect: WorkerPool::start(plan.autodetect),
            utility: WorkerPool::start(plan.utility),
            datafeed: WorkerPool::start(plan.datafeed),
        }
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.datafeed.shutdown(grace).await;
        self.autodetect.shutdown(grace).await;
        self.utility.shutdown(grace).await;
    }
}
