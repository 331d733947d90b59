//! Connection lifecycle notifications.
//!
//! Events are queued from the IO tasks and delivered in order by a single worker, so a slow
//! listener never stalls the network. Events beyond the queue capacity are dropped.

use crate::channel::Channel;
use crate::response::lock;
use crossfire::{AsyncRx, MTx};
use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventType {
    Connect,
    Close,
    Idle,
    Exception,
}

#[derive(Clone)]
pub struct ConnectionEvent {
    pub kind: ConnectionEventType,
    pub remote_addr: SocketAddr,
    pub channel: Channel,
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "event({:?}, {:?})", self.kind, self.channel)
    }
}

/// Receives [ConnectionEvent]s, in the order they happened on each channel.
///
/// An idle or broken channel reports IDLE or EXCEPTION, followed by CLOSE.
#[allow(unused_variables)]
pub trait ChannelEventListener: Send + Sync + 'static {
    fn on_channel_connect(&self, remote_addr: SocketAddr, channel: &Channel) {}

    fn on_channel_close(&self, remote_addr: SocketAddr, channel: &Channel) {}

    fn on_channel_exception(&self, remote_addr: SocketAddr, channel: &Channel) {}

    fn on_channel_idle(&self, remote_addr: SocketAddr, channel: &Channel) {}
}

pub(crate) struct EventPipe {
    tx: Mutex<Option<MTx<ConnectionEvent>>>,
    queued: Arc<AtomicUsize>,
    capacity: usize,
}

impl EventPipe {
    pub(crate) fn start(
        listener: Arc<dyn ChannelEventListener>, capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = crossfire::mpsc::unbounded_async::<ConnectionEvent>();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(Self::run(rx, listener, queued.clone()));
        (Self { tx: Mutex::new(Some(tx)), queued, capacity }, worker)
    }

    pub(crate) fn put(&self, event: ConnectionEvent) {
        let guard = lock(&self.tx);
        let Some(tx) = guard.as_ref() else {
            debug!("event pipe closed, drop {:?}", event);
            return;
        };
        let reserved = self.queued.fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
            if size < self.capacity { Some(size + 1) } else { None }
        });
        if let Err(size) = reserved {
            warn!("event queue size {} exceeds {}, drop {:?}", size, self.capacity, event);
            return;
        }
        if tx.send(event).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            warn!("event worker gone, event dropped");
        }
    }

    /// No more events are accepted, the worker exits after delivering what is queued
    pub(crate) fn close(&self) {
        lock(&self.tx).take();
    }

    async fn run(
        rx: AsyncRx<ConnectionEvent>, listener: Arc<dyn ChannelEventListener>,
        queued: Arc<AtomicUsize>,
    ) {
        while let Ok(event) = rx.recv().await {
            queued.fetch_sub(1, Ordering::AcqRel);
            let r = catch_unwind(AssertUnwindSafe(|| Self::deliver(listener.as_ref(), &event)));
            if r.is_err() {
                error!("channel event listener panicked on {:?}", event);
            }
        }
        debug!("event worker exit");
    }

    #[inline]
    fn deliver(listener: &dyn ChannelEventListener, event: &ConnectionEvent) {
        let (addr, ch) = (event.remote_addr, &event.channel);
        match event.kind {
            ConnectionEventType::Connect => listener.on_channel_connect(addr, ch),
            ConnectionEventType::Close => listener.on_channel_close(addr, ch),
            ConnectionEventType::Idle => listener.on_channel_idle(addr, ch),
            ConnectionEventType::Exception => listener.on_channel_exception(addr, ch),
        }
    }
}
