//! Resizable pools of tier workers.
//!
//! A pool runs N copies of the same worker loop as tokio tasks. Every worker
//! gets a [`WorkerToken`] and checks it between iterations; retiring a worker
//! flips its token and joins the task with a bounded timeout. Resizing is
//! serialized by one async lock per pool.
//!
//! Stopping is cooperative. A worker blocked inside a long synchronous
//! collaborator call cannot be preempted, so a stop can take as long as that
//! call; workers that overrun the join timeout are detached with a warning
//! and finish in the background.

use log::{error, info, warn};
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::MAX_WORKERS_PER_TIER;
use crate::error::PoolError;

/// Running flag shared between a worker and whoever may stop it.
#[derive(Debug, Clone)]
pub struct WorkerToken {
    id: usize,
    running: Arc<AtomicBool>,
}

impl WorkerToken {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

struct WorkerHandle {
    token: WorkerToken,
    task: JoinHandle<()>,
}

type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type WorkerFactory = Box<dyn Fn(WorkerToken) -> WorkerFuture + Send + Sync>;

pub struct WorkerPool {
    name: &'static str,
    min_workers: usize,
    join_timeout: Duration,
    factory: WorkerFactory,
    workers: Mutex<Vec<WorkerHandle>>,
    next_id: AtomicUsize,
    size: AtomicUsize,
}

impl WorkerPool {
    /// Creates an empty pool; call [`WorkerPool::resize`] to start workers.
    pub fn new<F, Fut>(
        name: &'static str,
        min_workers: usize,
        join_timeout: Duration,
        worker: F,
    ) -> Self
    where
        F: Fn(WorkerToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            min_workers,
            join_timeout,
            factory: Box::new(move |token| Box::pin(worker(token))),
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Grows or shrinks the pool to `target` workers and returns the new
    /// size. On error the pool keeps its current size.
    pub async fn resize(&self, target: usize) -> Result<usize, PoolError> {
        if target > MAX_WORKERS_PER_TIER {
            return Err(PoolError::TooLarge {
                pool: self.name,
                max: MAX_WORKERS_PER_TIER,
            });
        }
        if target < self.min_workers {
            return Err(PoolError::Empty(self.name));
        }

        let mut workers = self.workers.lock().await;
        let before = workers.len();
        if target > before {
            for _ in before..target {
                let token = WorkerToken::new(self.next_id.fetch_add(1, Ordering::Relaxed));
                let task = tokio::spawn((self.factory)(token.clone()));
                workers.push(WorkerHandle { token, task });
            }
        } else if target < before {
            let retired = workers.split_off(target);
            self.retire(retired).await;
        }
        self.size.store(workers.len(), Ordering::Release);

        if target != before {
            info!("{} pool resized {} -> {}", self.name, before, target);
        }
        Ok(target)
    }

    /// Stops every worker regardless of the pool's minimum.
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;
        let retired = std::mem::take(&mut *workers);
        let count = retired.len();
        self.retire(retired).await;
        self.size.store(0, Ordering::Release);
        info!("{} pool stopped ({} workers)", self.name, count);
    }

    async fn retire(&self, retired: Vec<WorkerHandle>) {
        for worker in &retired {
            worker.token.stop();
        }
        for mut worker in retired {
            match tokio::time::timeout(self.join_timeout, &mut worker.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("{} worker {} ended abnormally: {}", self.name, worker.token.id(), e)
                }
                Err(_) => warn!(
                    "{} worker {} did not stop within {:?}, detaching it",
                    self.name,
                    worker.token.id(),
                    self.join_timeout
                ),
            }
        }
    }
}

/// Items a worker handles back to back before handing its runtime thread to
/// other tasks.
pub const YIELD_EVERY: usize = 32;

/// Runs a synchronous handler, turning a panic into a logged `None`.
pub fn guarded<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(panic) => {
            error!("{} panicked: {}", what, panic_message(panic.as_ref()));
            None
        }
    }
}

pub fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
