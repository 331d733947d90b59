use broker_remoting::error::ProcessError;
use broker_remoting::*;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const OP_SLOW: i32 = 5;
pub const OP_ECHO: i32 = 10;
pub const OP_FAIL: i32 = 20;
pub const OP_PANIC: i32 = 21;
pub const OP_BUSY: i32 = 30;

/// Config with a fast reaper so timeouts are observed within a test
pub fn test_rpc_config() -> RemotingConfig {
    let mut rpc = RemotingConfig::default();
    rpc.timeout.scan_initial_delay = Duration::from_millis(50);
    rpc.timeout.scan_interval = Duration::from_millis(50);
    rpc.timeout.close_wait = Duration::from_secs(2);
    rpc
}

pub fn test_server_config() -> ServerConfig {
    ServerConfig { listen_addr: "127.0.0.1:0".to_string(), rpc: test_rpc_config() }
}

/// Start a server with the echo processor registered, returns it with its address
pub async fn init_server(
    config: ServerConfig, listener: Option<Arc<EventRecorder>>,
) -> Result<(RemotingServer, String), error::RemotingError> {
    let server = RemotingServer::new(config);
    server.register_processor(OP_ECHO, echo_processor(), None);
    if let Some(listener) = listener {
        server.register_channel_event_listener(listener);
    }
    server.start().await?;
    let addr = format!("127.0.0.1:{}", server.local_listen_port());
    Ok((server, addr))
}

/// Replies with the request body and ext fields
pub fn echo_processor() -> impl RequestProcessor {
    processor_fn(|req: Command| async move {
        let mut resp = Command::response(SysResponseCode::Success.code(), req.body);
        resp.ext_fields = req.ext_fields;
        Ok::<_, ProcessError>(Some(resp))
    })
}

/// Echo after a delay, counting how many requests it started
pub struct SlowProcessor {
    pub delay: Duration,
    pub started: Arc<AtomicUsize>,
}

impl SlowProcessor {
    pub fn new(delay: Duration) -> Self {
        Self { delay, started: Arc::new(AtomicUsize::new(0)) }
    }
}

impl RequestProcessor for SlowProcessor {
    fn process_request<'a>(
        &'a self, _ctx: &'a RequestContext, request: Command,
    ) -> BoxFuture<'a, Result<Option<Command>, ProcessError>> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok::<_, ProcessError>(Some(Command::response(
                SysResponseCode::Success.code(),
                request.body,
            )))
        })
    }
}

/// Declares itself overloaded for every request
pub struct BusyProcessor;

impl RequestProcessor for BusyProcessor {
    fn process_request<'a>(
        &'a self, _ctx: &'a RequestContext, _request: Command,
    ) -> BoxFuture<'a, Result<Option<Command>, ProcessError>> {
        Box::pin(async move { Err::<Option<Command>, ProcessError>("never run".into()) })
    }

    fn reject_request(&self) -> bool {
        true
    }
}

pub fn failing_processor() -> impl RequestProcessor {
    processor_fn(|_req: Command| async move {
        let e: ProcessError = "disk full".into();
        Err::<Option<Command>, _>(e)
    })
}

pub fn panicking_processor() -> impl RequestProcessor {
    processor_fn(|req: Command| async move {
        if req.opcode == OP_PANIC {
            panic!("bad state");
        }
        Ok::<_, ProcessError>(None)
    })
}

/// Records every connection event with the id of its channel
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<(ConnectionEventType, u64)>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, kind: ConnectionEventType, channel: &Channel) {
        debug!("recorded {:?} of {:?}", kind, channel);
        self.events.lock().unwrap().push((kind, channel.id()));
    }

    pub fn events(&self) -> Vec<(ConnectionEventType, u64)> {
        self.events.lock().unwrap().clone()
    }

    /// Kinds received by one channel, in order
    pub fn kinds_of(&self, channel_id: u64) -> Vec<ConnectionEventType> {
        self.events().into_iter().filter(|(_, id)| *id == channel_id).map(|(k, _)| k).collect()
    }

    pub fn count(&self, kind: ConnectionEventType) -> usize {
        self.events().iter().filter(|(k, _)| *k == kind).count()
    }

    /// Poll until `n` events of `kind` are seen, false on timeout
    pub async fn wait_for(&self, kind: ConnectionEventType, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.count(kind) >= n).await
    }
}

impl ChannelEventListener for EventRecorder {
    fn on_channel_connect(&self, _remote_addr: std::net::SocketAddr, channel: &Channel) {
        self.record(ConnectionEventType::Connect, channel);
    }

    fn on_channel_close(&self, _remote_addr: std::net::SocketAddr, channel: &Channel) {
        self.record(ConnectionEventType::Close, channel);
    }

    fn on_channel_exception(&self, _remote_addr: std::net::SocketAddr, channel: &Channel) {
        self.record(ConnectionEventType::Exception, channel);
    }

    fn on_channel_idle(&self, _remote_addr: std::net::SocketAddr, channel: &Channel) {
        self.record(ConnectionEventType::Idle, channel);
    }
}

pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
