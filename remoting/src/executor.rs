//! Bounded pools that run processor jobs and async callbacks off the IO tasks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("executor {pool} rejected the job, {in_flight} jobs in flight")]
pub struct RejectedExecution {
    pub pool: String,
    pub in_flight: usize,
}

/// A named pool of at most `capacity` concurrent jobs.
///
/// Jobs are spawned on the given runtime handle, or on the current runtime. A job submitted while
/// the pool is full or shut down is rejected instead of queued. Cloning shares the pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    capacity: usize,
    slots: Arc<Semaphore>,
    runtime: Option<Handle>,
    active: AtomicUsize,
    closed: AtomicBool,
}

/// Held by a running job
struct Slot {
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self::build(name.into(), capacity, None)
    }

    /// Spawn jobs on a dedicated runtime
    pub fn with_runtime(name: impl Into<String>, capacity: usize, runtime: Handle) -> Self {
        Self::build(name.into(), capacity, Some(runtime))
    }

    fn build(name: String, capacity: usize, runtime: Option<Handle>) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                slots: Arc::new(Semaphore::new(capacity)),
                runtime,
                active: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn execute<F>(&self, job: F) -> Result<(), RejectedExecution>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(slot) = self.take_slot() else {
            return Err(self.rejected());
        };
        self.spawn(async move {
            let _slot = slot;
            job.await
        });
        Ok(())
    }

    /// Like [WorkerPool::execute] for a plain closure, handing it back when rejected so the
    /// caller can still run it.
    pub fn try_run<J>(&self, job: J) -> Result<(), J>
    where
        J: FnOnce() + Send + 'static,
    {
        let Some(slot) = self.take_slot() else {
            return Err(job);
        };
        self.spawn(async move {
            let _slot = slot;
            job()
        });
        Ok(())
    }

    #[inline]
    fn take_slot(&self) -> Option<Slot> {
        let permit = self.inner.slots.clone().try_acquire_owned().ok()?;
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        Some(Slot { pool: self.inner.clone(), _permit: permit })
    }

    #[inline]
    fn spawn<F>(&self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.inner.runtime.as_ref() {
            Some(rt) => {
                rt.spawn(f);
            }
            None => {
                tokio::spawn(f);
            }
        }
    }

    fn rejected(&self) -> RejectedExecution {
        RejectedExecution { pool: self.inner.name.clone(), in_flight: self.in_flight() }
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, then wait up to `wait` for running jobs to finish.
    ///
    /// Returns false when jobs are still running after `wait`.
    pub async fn shutdown(&self, wait: Duration) -> bool {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.slots.close();
        }
        let deadline = Instant::now() + wait;
        loop {
            let left = self.in_flight();
            if left == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("executor {} shutdown with {} jobs still running", self.inner.name, left);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "executor({}, {}/{})", self.inner.name, self.in_flight(), self.inner.capacity)
    }
}
