//! A live TCP connection and its reader/writer tasks.
//!
//! Lifecycle: registered (socket split, tasks spawned), active (CONNECT emitted), then closed
//! exactly once by [RemotingEngine::close_channel], whatever triggers it (peer EOF, IO error,
//! corrupted stream, idle timeout, local close, shutdown).

use crate::event::ConnectionEventType;
use crate::proto::DecodeError;
use crate::remoting::RemotingEngine;
use crate::response::lock;
use broker_remoting_core::{Command, error::RemotingError};
use bytes::BytesMut;
use crossfire::{AsyncRx, MAsyncRx, MTx};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Told whether the command reached the socket
pub(crate) type WriteListener = Box<dyn FnOnce(Result<(), &io::Error>) + Send + 'static>;

pub(crate) struct Outbound {
    cmd: Command,
    listener: Option<WriteListener>,
}

const READ_BUF_SIZE: usize = 8 * 1024;
/// Flush a write batch once it grows past this
const MAX_BATCH_SIZE: usize = 256 * 1024;

/// Handle to a connection, cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: u64,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    writer_tx: MTx<Outbound>,
    close_tx: Mutex<Option<MTx<()>>>,
    closed: AtomicBool,
    born: Instant,
    /// millis since `born` of the last read or write
    last_active: AtomicU64,
    engine: Weak<RemotingEngine>,
}

impl Channel {
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline(always)]
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    #[inline(always)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the connection, pending requests on it fail with ConnectionClosed.
    pub fn close(&self) {
        match self.inner.engine.upgrade() {
            Some(engine) => engine.close_channel(self),
            None => {
                self.mark_closed();
            }
        }
    }

    /// Queue a command for the writer task.
    ///
    /// On Err the listener is dropped without being called.
    pub(crate) fn write(
        &self, cmd: Command, listener: Option<WriteListener>,
    ) -> Result<(), RemotingError> {
        if !self.is_active() {
            return Err(RemotingError::send_failed(self.remote_addr(), "channel closed"));
        }
        if self.inner.writer_tx.send(Outbound { cmd, listener }).is_err() {
            return Err(RemotingError::send_failed(self.remote_addr(), "writer exited"));
        }
        Ok(())
    }

    /// Flip to closed and signal both tasks to exit. True only for the first call.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        lock(&self.inner.close_tx).take();
        true
    }

    #[inline]
    fn touch(&self) {
        let ms = self.inner.born.elapsed().as_millis() as u64;
        self.inner.last_active.fetch_max(ms, Ordering::Relaxed);
    }

    /// Time left before the channel counts as idle
    #[inline]
    fn idle_left(&self, idle_timeout: Duration) -> Duration {
        let last = Duration::from_millis(self.inner.last_active.load(Ordering::Relaxed));
        let idle_for = self.inner.born.elapsed().saturating_sub(last);
        idle_timeout.saturating_sub(idle_for)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "channel(id={}, remote={})", self.inner.id, self.inner.remote_addr)
    }
}

/// Wrap an established stream into a [Channel] and start serving it.
pub(crate) fn spawn_connection(
    engine: &Arc<RemotingEngine>, stream: TcpStream,
) -> io::Result<Channel> {
    let remote_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr().ok();
    if let Err(e) = stream.set_nodelay(true) {
        warn!("set_nodelay on {} failed: {}", remote_addr, e);
    }
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = crossfire::mpsc::unbounded_async::<Outbound>();
    let (close_tx, close_rx) = crossfire::mpmc::unbounded_async::<()>();
    let channel = Channel {
        inner: Arc::new(ChannelInner {
            id: engine.next_channel_id(),
            remote_addr,
            local_addr,
            writer_tx,
            close_tx: Mutex::new(Some(close_tx)),
            closed: AtomicBool::new(false),
            born: Instant::now(),
            last_active: AtomicU64::new(0),
            engine: Arc::downgrade(engine),
        }),
    };
    debug!("{:?} registered", channel);
    engine.register_channel(&channel);

    let writer = Writer {
        channel: channel.clone(),
        engine: engine.clone(),
        writer: write_half,
        rx: writer_rx,
        close_rx: close_rx.clone(),
    };
    tokio::spawn(writer.run());
    let reader = Reader { channel: channel.clone(), engine: engine.clone(), reader: read_half, close_rx };
    tokio::spawn(reader.run());
    Ok(channel)
}

struct Reader {
    channel: Channel,
    engine: Arc<RemotingEngine>,
    reader: OwnedReadHalf,
    close_rx: MAsyncRx<()>,
}

impl Reader {
    async fn run(mut self) {
        let idle_timeout = self.engine.config().timeout.idle_timeout;
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        loop {
            let idle_left = if idle_timeout.is_zero() { None } else { Some(self.channel.idle_left(idle_timeout)) };
            if idle_left == Some(Duration::ZERO) {
                info!("{:?} idle for {:?}, closing", self.channel, idle_timeout);
                self.engine.put_event(ConnectionEventType::Idle, &self.channel);
                self.engine.close_channel(&self.channel);
                return;
            }
            let idle_sleep = async move {
                match idle_left {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            if buf.capacity() - buf.len() < READ_BUF_SIZE / 2 {
                buf.reserve(READ_BUF_SIZE);
            }
            let r = tokio::select! {
                r = self.reader.read_buf(&mut buf) => r,
                _ = self.close_rx.recv() => {
                    trace!("{:?} reader exits on close", self.channel);
                    return;
                }
                _ = idle_sleep => continue,
            };
            match r {
                Ok(0) => {
                    debug!("{:?} closed by peer", self.channel);
                    self.engine.close_channel(&self.channel);
                    return;
                }
                Ok(_) => {
                    self.channel.touch();
                    if !self.decode_all(&mut buf) {
                        return;
                    }
                }
                Err(e) => {
                    if self.channel.is_active() {
                        warn!("{:?} read error: {}", self.channel, e);
                        self.engine.put_event(ConnectionEventType::Exception, &self.channel);
                        self.engine.close_channel(&self.channel);
                    }
                    return;
                }
            }
        }
    }

    /// Dispatch every whole frame in `buf`, false when the stream is corrupted
    fn decode_all(&self, buf: &mut BytesMut) -> bool {
        loop {
            match self.engine.frame_codec().decode(buf) {
                Ok(Some(cmd)) => {
                    trace!("{:?} recv {:?}", self.channel, cmd);
                    self.engine.process_message_received(&self.channel, cmd);
                }
                Ok(None) => return true,
                Err(DecodeError::Header { correlation_id, opcode, kind, reason }) => {
                    warn!(
                        "{:?} bad header of {:?} id={} opcode={}: {}",
                        self.channel, kind, correlation_id, opcode, reason
                    );
                    self.engine.reply_bad_header(&self.channel, correlation_id, opcode, kind, reason);
                }
                Err(DecodeError::Corrupted(e)) => {
                    error!("{:?} decode error: {}", self.channel, e);
                    self.engine.put_event(ConnectionEventType::Exception, &self.channel);
                    self.engine.close_channel(&self.channel);
                    return false;
                }
            }
        }
    }
}

struct Writer {
    channel: Channel,
    engine: Arc<RemotingEngine>,
    writer: OwnedWriteHalf,
    rx: AsyncRx<Outbound>,
    close_rx: MAsyncRx<()>,
}

impl Writer {
    async fn run(mut self) {
        let write_timeout = self.engine.config().timeout.write_timeout;
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        let mut listeners: Vec<WriteListener> = Vec::new();
        loop {
            let first = tokio::select! {
                r = self.rx.recv() => match r {
                    Ok(item) => item,
                    Err(_) => break,
                },
                _ = self.close_rx.recv() => break,
            };
            self.encode(first, &mut buf, &mut listeners);
            while buf.len() < MAX_BATCH_SIZE {
                match self.rx.try_recv() {
                    Ok(item) => self.encode(item, &mut buf, &mut listeners),
                    Err(_) => break,
                }
            }
            if buf.is_empty() {
                continue;
            }
            let r = match tokio::time::timeout(write_timeout, self.writer.write_all(&buf)).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")),
            };
            buf.clear();
            match r {
                Ok(()) => {
                    self.channel.touch();
                    for l in listeners.drain(..) {
                        l(Ok(()));
                    }
                }
                Err(e) => {
                    warn!("{:?} write error: {}", self.channel, e);
                    for l in listeners.drain(..) {
                        l(Err(&e));
                    }
                    if self.channel.is_active() {
                        self.engine.put_event(ConnectionEventType::Exception, &self.channel);
                        self.engine.close_channel(&self.channel);
                    }
                    break;
                }
            }
        }
        let closed = io::Error::new(io::ErrorKind::NotConnected, "channel closed");
        while let Ok(item) = self.rx.try_recv() {
            if let Some(l) = item.listener {
                l(Err(&closed));
            }
        }
        let _ = self.writer.shutdown().await;
        trace!("{:?} writer exits", self.channel);
    }

    #[inline]
    fn encode(&self, item: Outbound, buf: &mut BytesMut, listeners: &mut Vec<WriteListener>) {
        trace!("{:?} send {:?}", self.channel, item.cmd);
        match self.engine.frame_codec().encode(&item.cmd, buf) {
            Ok(()) => {
                if let Some(l) = item.listener {
                    listeners.push(l);
                }
            }
            Err(e) => {
                error!("{:?} encode {:?} failed: {}", self.channel, item.cmd, e);
                if let Some(l) = item.listener {
                    l(Err(&io::Error::new(io::ErrorKind::InvalidData, e.to_string())));
                }
            }
        }
    }
}
