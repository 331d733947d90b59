use crate::channel::{self, Channel};
use crate::event::ChannelEventListener;
use crate::executor::WorkerPool;
use crate::processor::{RequestProcessor, RpcHook};
use crate::remoting::RemotingEngine;
use broker_remoting_core::{ClientConfig, Command, error::RemotingError};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Connects to servers by address and invokes them.
///
/// One channel is kept per address and reused while it stays active. The client also serves
/// requests pushed back by servers, through its own registered processors.
pub struct RemotingClient {
    config: ClientConfig,
    engine: Arc<RemotingEngine>,
    channel_table: Mutex<FxHashMap<String, Channel>>,
    dial_locks: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

impl RemotingClient {
    pub fn new(config: ClientConfig) -> Self {
        let engine = RemotingEngine::new("client", config.rpc.clone());
        Self {
            config,
            engine,
            channel_table: Mutex::new(FxHashMap::default()),
            dial_locks: Mutex::new(FxHashMap::default()),
        }
    }

    /// Start the reaper and the event worker, must be called within a tokio runtime
    pub fn start(&self) {
        self.engine.start();
    }

    /// Close every channel and stop the engine, idempotent
    pub async fn shutdown(&self) {
        self.channel_table.lock().await.clear();
        self.engine.shutdown().await;
    }

    #[inline(always)]
    pub fn engine(&self) -> &Arc<RemotingEngine> {
        &self.engine
    }

    /// The channel to `addr`, connecting when there is no active one.
    pub async fn connect(&self, addr: &str) -> Result<Channel, RemotingError> {
        self.connect_within(addr, self.config.rpc.timeout.connect_timeout).await
    }

    /// Dial at most `limit` (capped by `connect_timeout`). Only dials to the same address wait for
    /// each other, the channel table is never locked across a dial.
    async fn connect_within(&self, addr: &str, limit: Duration) -> Result<Channel, RemotingError> {
        if self.engine.is_shutdown() {
            return Err(RemotingError::Shutdown);
        }
        if let Some(ch) = self.active_channel(addr).await {
            return Ok(ch);
        }
        let connect_timeout = self.config.rpc.timeout.connect_timeout.min(limit);
        let deadline = tokio::time::Instant::now() + connect_timeout;
        let dial_lock = self.dial_lock(addr).await;
        let Ok(_dialing) = tokio::time::timeout_at(deadline, dial_lock.lock()).await else {
            warn!("connect to {} timeout after {:?} waiting for another dial", addr, connect_timeout);
            return Err(RemotingError::ConnectFailed {
                addr: addr.to_string(),
                reason: format!("timeout after {:?}", connect_timeout),
            });
        };
        // the dial we waited for may have succeeded
        if let Some(ch) = self.active_channel(addr).await {
            return Ok(ch);
        }
        let stream = match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("connect to {} failed: {}", addr, e);
                return Err(RemotingError::ConnectFailed { addr: addr.to_string(), reason: e.to_string() });
            }
            Err(_) => {
                warn!("connect to {} timeout after {:?}", addr, connect_timeout);
                return Err(RemotingError::ConnectFailed {
                    addr: addr.to_string(),
                    reason: format!("timeout after {:?}", connect_timeout),
                });
            }
        };
        let ch = channel::spawn_connection(&self.engine, stream).map_err(|e| {
            RemotingError::ConnectFailed { addr: addr.to_string(), reason: e.to_string() }
        })?;
        info!("client connected to {} as {:?}", addr, ch);
        self.channel_table.lock().await.insert(addr.to_string(), ch.clone());
        Ok(ch)
    }

    async fn dial_lock(&self, addr: &str) -> Arc<Mutex<()>> {
        self.dial_locks.lock().await.entry(addr.to_string()).or_default().clone()
    }

    async fn active_channel(&self, addr: &str) -> Option<Channel> {
        let mut table = self.channel_table.lock().await;
        match table.get(addr) {
            Some(ch) if ch.is_active() => Some(ch.clone()),
            Some(_) => {
                table.remove(addr);
                None
            }
            None => None,
        }
    }

    /// Connect within the call's `timeout`, returning the channel and the time left for the call
    async fn channel_for_call(
        &self, addr: &str, timeout: Duration,
    ) -> Result<(Channel, Duration), RemotingError> {
        let begin = Instant::now();
        let ch = self.connect_within(addr, timeout).await?;
        let left = timeout.saturating_sub(begin.elapsed());
        if left.is_zero() {
            return Err(RemotingError::Timeout {
                addr: addr.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok((ch, left))
    }

    /// Close the channel to `addr`, if any
    pub async fn close_channel(&self, addr: &str) {
        let ch = self.channel_table.lock().await.remove(addr);
        if let Some(ch) = ch {
            self.engine.close_channel(&ch);
        }
    }

    pub async fn invoke_sync(
        &self, addr: &str, request: Command, timeout: Duration,
    ) -> Result<Command, RemotingError> {
        let (ch, left) = self.channel_for_call(addr, timeout).await?;
        self.engine.invoke_sync(&ch, request, left).await
    }

    pub async fn invoke_async<F>(
        &self, addr: &str, request: Command, timeout: Duration, callback: F,
    ) -> Result<(), RemotingError>
    where
        F: FnOnce(Result<Command, RemotingError>) + Send + 'static,
    {
        let (ch, left) = self.channel_for_call(addr, timeout).await?;
        self.engine.invoke_async(&ch, request, left, callback).await
    }

    pub async fn invoke_oneway(
        &self, addr: &str, request: Command, timeout: Duration,
    ) -> Result<(), RemotingError> {
        let (ch, left) = self.channel_for_call(addr, timeout).await?;
        self.engine.invoke_oneway(&ch, request, left).await
    }

    pub fn register_processor<P: RequestProcessor>(
        &self, opcode: i32, processor: P, executor: Option<WorkerPool>,
    ) {
        self.engine.register_processor(opcode, Arc::new(processor), executor);
    }

    /// Serves opcodes with no processor of their own
    pub fn register_default_processor<P: RequestProcessor>(&self, processor: P, executor: WorkerPool) {
        self.engine.register_default_processor(Arc::new(processor), executor);
    }

    pub fn register_rpc_hook<H: RpcHook>(&self, hook: H) {
        self.engine.register_rpc_hook(Arc::new(hook));
    }

    /// Must be called before [RemotingClient::start]
    pub fn register_channel_event_listener(&self, listener: Arc<dyn ChannelEventListener>) {
        self.engine.register_channel_event_listener(listener);
    }
}
