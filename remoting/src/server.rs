use crate::channel::{self, Channel};
use crate::event::ChannelEventListener;
use crate::executor::WorkerPool;
use crate::processor::{RequestProcessor, RpcHook};
use crate::remoting::RemotingEngine;
use crate::response::lock;
use broker_remoting_core::{Command, ServerConfig, error::RemotingError};
use futures::future::{AbortHandle, Abortable};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// Accepts connections and serves the registered processors on them.
///
/// Invocations toward a connected peer go through the [Channel] it came in on.
pub struct RemotingServer {
    config: ServerConfig,
    engine: Arc<RemotingEngine>,
    listener_abort: Mutex<Option<AbortHandle>>,
    listen_port: AtomicU16,
}

impl RemotingServer {
    pub fn new(config: ServerConfig) -> Self {
        let engine = RemotingEngine::new("server", config.rpc.clone());
        Self { config, engine, listener_abort: Mutex::new(None), listen_port: AtomicU16::new(0) }
    }

    /// Bind the listen address and start accepting. A bind failure is returned, nothing is left
    /// running in that case.
    pub async fn start(&self) -> Result<(), RemotingError> {
        let addr = self.config.listen_addr.as_str();
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("bind addr {:?} err: {}", addr, e);
                return Err(RemotingError::Bind { addr: addr.to_string(), reason: e.to_string() });
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| RemotingError::Bind { addr: addr.to_string(), reason: e.to_string() })?;
        self.listen_port.store(local_addr.port(), Ordering::Release);
        self.engine.start();

        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let engine = self.engine.clone();
        let abrt = Abortable::new(
            async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            if let Err(e) = channel::spawn_connection(&engine, stream) {
                                warn!("serve connection from {} failed: {}", peer, e);
                            }
                        }
                        Err(e) => {
                            // usually out of fds, give in-flight connections a chance to finish
                            warn!("listener {} accept error: {}", local_addr, e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            },
            abort_registration,
        );
        tokio::spawn(abrt);
        if let Some(old) = lock(&self.listener_abort).replace(abort_handle) {
            old.abort();
        }
        info!("remoting server listening on {}", local_addr);
        Ok(())
    }

    /// The bound port, 0 before start
    #[inline]
    pub fn local_listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Acquire)
    }

    /// Gracefully close the server, idempotent.
    ///
    /// Steps:
    /// - the accept loop is aborted
    /// - the reaper stops, every connection is closed and its pending requests fail
    /// - queued connection events are delivered
    /// - executors drain within `close_wait`
    pub async fn shutdown(&self) {
        let abort = lock(&self.listener_abort).take();
        if let Some(h) = abort {
            h.abort();
            info!("listener on port {} has closed", self.local_listen_port());
        }
        self.engine.shutdown().await;
    }

    /// Live connections
    #[inline]
    pub fn channels(&self) -> Vec<Channel> {
        self.engine.channels()
    }

    #[inline(always)]
    pub fn engine(&self) -> &Arc<RemotingEngine> {
        &self.engine
    }

    /// See [RemotingEngine::register_processor]
    pub fn register_processor<P: RequestProcessor>(
        &self, opcode: i32, processor: P, executor: Option<WorkerPool>,
    ) {
        self.engine.register_processor(opcode, Arc::new(processor), executor);
    }

    pub fn register_default_processor<P: RequestProcessor>(&self, processor: P, executor: WorkerPool) {
        self.engine.register_default_processor(Arc::new(processor), executor);
    }

    pub fn register_rpc_hook<H: RpcHook>(&self, hook: H) {
        self.engine.register_rpc_hook(Arc::new(hook));
    }

    /// Must be called before [RemotingServer::start]
    pub fn register_channel_event_listener(&self, listener: Arc<dyn ChannelEventListener>) {
        self.engine.register_channel_event_listener(listener);
    }

    pub async fn invoke_sync(
        &self, channel: &Channel, request: Command, timeout: Duration,
    ) -> Result<Command, RemotingError> {
        self.engine.invoke_sync(channel, request, timeout).await
    }

    pub async fn invoke_async<F>(
        &self, channel: &Channel, request: Command, timeout: Duration, callback: F,
    ) -> Result<(), RemotingError>
    where
        F: FnOnce(Result<Command, RemotingError>) + Send + 'static,
    {
        self.engine.invoke_async(channel, request, timeout, callback).await
    }

    pub async fn invoke_oneway(
        &self, channel: &Channel, request: Command, timeout: Duration,
    ) -> Result<(), RemotingError> {
        self.engine.invoke_oneway(channel, request, timeout).await
    }
}
