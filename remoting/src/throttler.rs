use broker_remoting_core::error::RemotingError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Bounds how many requests of one kind may be outstanding.
///
/// A permit is held from admission until the request is done (written for one-way, completed
/// for async), and given back exactly once by dropping the [Permit].
pub struct Throttler {
    name: &'static str,
    thresholds: usize,
    semaphore: Option<Arc<Semaphore>>,
}

/// Admission ticket of a [Throttler], released on drop
pub struct Permit {
    _inner: Option<OwnedSemaphorePermit>,
}

impl Throttler {
    /// thresholds == 0 disables the gate
    pub fn new(name: &'static str, thresholds: usize) -> Self {
        let semaphore = if thresholds > 0 { Some(Arc::new(Semaphore::new(thresholds))) } else { None };
        Self { name, thresholds, semaphore }
    }

    /// Take a permit, waiting at most `wait` for one to be released.
    ///
    /// A zero `wait` fails immediately when the gate is full.
    pub async fn acquire(&self, wait: Duration) -> Result<Permit, RemotingError> {
        let Some(sem) = self.semaphore.as_ref() else {
            return Ok(Permit { _inner: None });
        };
        if wait.is_zero() {
            return match sem.clone().try_acquire_owned() {
                Ok(p) => Ok(Permit { _inner: Some(p) }),
                Err(TryAcquireError::NoPermits) => Err(self.too_many(wait)),
                Err(TryAcquireError::Closed) => Err(RemotingError::Shutdown),
            };
        }
        match tokio::time::timeout(wait, sem.clone().acquire_owned()).await {
            Ok(Ok(p)) => Ok(Permit { _inner: Some(p) }),
            Ok(Err(_)) => Err(RemotingError::Shutdown),
            Err(_) => Err(self.too_many(wait)),
        }
    }

    fn too_many(&self, wait: Duration) -> RemotingError {
        RemotingError::TooManyRequests(format!(
            "{} gate: no permit after {}ms, {} in flight of {}",
            self.name,
            wait.as_millis(),
            self.get_inflight_count(),
            self.thresholds
        ))
    }

    #[inline]
    pub fn available(&self) -> usize {
        match self.semaphore.as_ref() {
            Some(sem) => sem.available_permits(),
            None => usize::MAX,
        }
    }

    #[inline]
    pub fn get_inflight_count(&self) -> usize {
        match self.semaphore.as_ref() {
            Some(sem) => self.thresholds.saturating_sub(sem.available_permits()),
            None => 0,
        }
    }

    /// Fail all waiters and further acquires with Shutdown
    pub fn close(&self) {
        if let Some(sem) = self.semaphore.as_ref() {
            sem.close();
        }
    }
}
