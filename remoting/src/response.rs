//! Outstanding requests awaiting their response.
//!
//! Every exit of a pending request (response arrived, timed out, send failed, connection closed,
//! shutdown) starts by removing its entry from the [ResponseTable]. Whoever removes the entry owns
//! its completion, so the caller is notified exactly once.

use crate::throttler::Permit;
use broker_remoting_core::{Command, error::RemotingError};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Called once with the outcome of [crate::RemotingEngine::invoke_async]
pub type InvokeCallback = Box<dyn FnOnce(Result<Command, RemotingError>) + Send + 'static>;

pub(crate) enum Completion {
    Sync(oneshot::Sender<Result<Command, RemotingError>>),
    Async { callback: InvokeCallback, permit: Permit },
}

pub struct ResponseFuture {
    correlation_id: u64,
    channel_id: u64,
    remote_addr: String,
    created_at: Instant,
    timeout: Duration,
    completion: Mutex<Option<Completion>>,
}

impl ResponseFuture {
    pub(crate) fn new(
        correlation_id: u64, channel_id: u64, remote_addr: String, timeout: Duration,
        completion: Completion,
    ) -> Self {
        Self {
            correlation_id,
            channel_id,
            remote_addr,
            created_at: Instant::now(),
            timeout,
            completion: Mutex::new(Some(completion)),
        }
    }

    #[inline(always)]
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    #[inline(always)]
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    #[inline(always)]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    #[inline(always)]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[inline]
    pub fn deadline(&self) -> Instant {
        self.created_at + self.timeout
    }

    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    #[inline]
    pub(crate) fn timeout_error(&self) -> RemotingError {
        RemotingError::Timeout {
            addr: self.remote_addr.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Some only for the first caller
    #[inline]
    pub(crate) fn take_completion(&self) -> Option<Completion> {
        lock(&self.completion).take()
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "response_future(id={}, addr={}, elapsed={:?}, timeout={:?})",
            self.correlation_id,
            self.remote_addr,
            self.created_at.elapsed(),
            self.timeout
        )
    }
}

#[inline]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct ResponseTable {
    entries: Mutex<FxHashMap<u64, Arc<ResponseFuture>>>,
}

impl ResponseTable {
    pub(crate) fn insert(&self, fut: ResponseFuture) {
        let id = fut.correlation_id;
        if lock(&self.entries).insert(id, Arc::new(fut)).is_some() {
            error!("correlation id {} registered twice", id);
        }
    }

    #[inline]
    pub fn remove(&self, correlation_id: u64) -> Option<Arc<ResponseFuture>> {
        lock(&self.entries).remove(&correlation_id)
    }

    /// Remove and return all entries past their deadline
    pub fn take_expired(&self, now: Instant) -> Vec<Arc<ResponseFuture>> {
        let mut expired = Vec::new();
        lock(&self.entries).retain(|_, fut| {
            if fut.is_expired(now) {
                expired.push(fut.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Remove and return all entries sent on one channel
    pub fn take_by_channel(&self, channel_id: u64) -> Vec<Arc<ResponseFuture>> {
        let mut taken = Vec::new();
        lock(&self.entries).retain(|_, fut| {
            if fut.channel_id == channel_id {
                taken.push(fut.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn drain(&self) -> Vec<Arc<ResponseFuture>> {
        lock(&self.entries).drain().map(|(_, fut)| fut).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
