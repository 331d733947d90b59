//! The engine shared by [crate::RemotingServer] and [crate::RemotingClient].
//!
//! It owns the response table, the admission gates, the processor registry, the executors, the
//! reaper and the event pipe. Connections are served by [crate::channel] tasks which hand every
//! decoded command to [RemotingEngine::process_message_received].

use crate::channel::{Channel, WriteListener};
use crate::event::{ChannelEventListener, ConnectionEvent, ConnectionEventType, EventPipe};
use crate::executor::WorkerPool;
use crate::processor::{ProcessorPair, RequestContext, RequestProcessor, RpcHook};
use crate::proto::FrameCodec;
use crate::response::{Completion, InvokeCallback, ResponseFuture, ResponseTable, lock};
use crate::throttler::Throttler;
use crate::timer;
use arc_swap::{ArcSwap, ArcSwapOption};
use broker_remoting_core::{
    Command, CommandKind, RemotingConfig, SysResponseCode, error::RemotingError,
};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Default)]
struct EngineTasks {
    reaper: Option<JoinHandle<()>>,
    event_worker: Option<JoinHandle<()>>,
}

pub struct RemotingEngine {
    name: &'static str,
    config: RemotingConfig,
    codec: FrameCodec,
    response_table: ResponseTable,
    oneway_gate: Throttler,
    async_gate: Throttler,
    processor_table: ArcSwap<FxHashMap<i32, ProcessorPair>>,
    default_processor: ArcSwapOption<ProcessorPair>,
    rpc_hook: RwLock<Option<Arc<dyn RpcHook>>>,
    event_listener: RwLock<Option<Arc<dyn ChannelEventListener>>>,
    event_pipe: RwLock<Option<EventPipe>>,
    channels: Mutex<FxHashMap<u64, Channel>>,
    public_executor: WorkerPool,
    callback_executor: WorkerPool,
    next_correlation_id: AtomicU64,
    next_channel_id: AtomicU64,
    tasks: Mutex<EngineTasks>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl RemotingEngine {
    pub fn new(name: &'static str, config: RemotingConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            codec: FrameCodec::new(config.max_frame_len),
            response_table: ResponseTable::default(),
            oneway_gate: Throttler::new("oneway", config.oneway_permits),
            async_gate: Throttler::new("async", config.async_permits),
            processor_table: ArcSwap::from_pointee(FxHashMap::default()),
            default_processor: ArcSwapOption::empty(),
            rpc_hook: RwLock::new(None),
            event_listener: RwLock::new(None),
            event_pipe: RwLock::new(None),
            channels: Mutex::new(FxHashMap::default()),
            public_executor: WorkerPool::new(
                format!("{}_public", name),
                config.public_executor_capacity,
            ),
            callback_executor: WorkerPool::new(
                format!("{}_callback", name),
                config.callback_executor_capacity,
            ),
            next_correlation_id: AtomicU64::new(1),
            next_channel_id: AtomicU64::new(1),
            tasks: Mutex::new(EngineTasks::default()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            config,
        })
    }

    #[inline(always)]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline(always)]
    pub fn config(&self) -> &RemotingConfig {
        &self.config
    }

    #[inline(always)]
    pub(crate) fn frame_codec(&self) -> &FrameCodec {
        &self.codec
    }

    #[inline]
    pub(crate) fn next_channel_id(&self) -> u64 {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    fn next_correlation_id(&self) -> u64 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Executor for processors registered without one
    #[inline(always)]
    pub fn public_executor(&self) -> &WorkerPool {
        &self.public_executor
    }

    /// Requests waiting for their response
    #[inline]
    pub fn pending_requests(&self) -> usize {
        self.response_table.len()
    }

    #[inline]
    pub fn available_async_permits(&self) -> usize {
        self.async_gate.available()
    }

    #[inline]
    pub fn available_oneway_permits(&self) -> usize {
        self.oneway_gate.available()
    }

    /// Live channels
    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.channels).values().cloned().collect()
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ---- registration ----

    /// Route `opcode` to `processor`, run on `executor` or the public executor.
    ///
    /// Registering an opcode again replaces the previous processor.
    pub fn register_processor(
        &self, opcode: i32, processor: Arc<dyn RequestProcessor>, executor: Option<WorkerPool>,
    ) {
        let executor = executor.unwrap_or_else(|| self.public_executor.clone());
        let pair = ProcessorPair::new(processor, executor);
        self.processor_table.rcu(|table| {
            let mut table: FxHashMap<i32, ProcessorPair> = (**table).clone();
            table.insert(opcode, pair.clone());
            table
        });
    }

    /// Handles opcodes no processor is registered for
    pub fn register_default_processor(
        &self, processor: Arc<dyn RequestProcessor>, executor: WorkerPool,
    ) {
        self.default_processor.store(Some(Arc::new(ProcessorPair::new(processor, executor))));
    }

    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        *self.rpc_hook.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Only takes effect when registered before start
    pub fn register_channel_event_listener(&self, listener: Arc<dyn ChannelEventListener>) {
        if self.started.load(Ordering::SeqCst) {
            warn!("{} already started, channel event listener ignored", self.name);
            return;
        }
        *self.event_listener.write().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    #[inline]
    fn rpc_hook(&self) -> Option<Arc<dyn RpcHook>> {
        self.rpc_hook.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    #[inline]
    fn lookup_processor(&self, opcode: i32) -> Option<ProcessorPair> {
        if let Some(pair) = self.processor_table.load().get(&opcode) {
            return Some(pair.clone());
        }
        self.default_processor.load_full().map(|pair| ProcessorPair::clone(&pair))
    }

    // ---- lifecycle ----

    /// Start the reaper, and the event worker if a listener is registered
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = lock(&self.tasks);
        let listener = self.event_listener.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(listener) = listener {
            let (pipe, worker) = EventPipe::start(listener, self.config.event_queue_capacity);
            *self.event_pipe.write().unwrap_or_else(|e| e.into_inner()) = Some(pipe);
            tasks.event_worker = Some(worker);
        }
        let timeout = &self.config.timeout;
        tasks.reaper = Some(timer::spawn_reaper(
            Arc::downgrade(self),
            timeout.scan_initial_delay,
            timeout.scan_interval,
        ));
        info!("{} remoting engine started", self.name);
    }

    /// Idempotent. Stops the reaper, closes every channel (CLOSE emitted once each), fails
    /// whatever is still pending, drains the event worker, then the executors.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reaper, event_worker) = {
            let mut tasks = lock(&self.tasks);
            (tasks.reaper.take(), tasks.event_worker.take())
        };
        if let Some(reaper) = reaper {
            reaper.abort();
            let _ = reaper.await;
        }
        for channel in self.channels() {
            self.close_channel(&channel);
        }
        for fut in self.response_table.drain() {
            self.complete(&fut, Err(RemotingError::Shutdown));
        }
        let pipe = self.event_pipe.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pipe) = pipe {
            pipe.close();
        }
        let close_wait = self.config.timeout.close_wait;
        if let Some(worker) = event_worker {
            if tokio::time::timeout(close_wait, worker).await.is_err() {
                warn!("{} event worker not drained in {:?}", self.name, close_wait);
            }
        }
        self.public_executor.shutdown(close_wait).await;
        self.callback_executor.shutdown(close_wait).await;
        self.oneway_gate.close();
        self.async_gate.close();
        info!("{} remoting engine shutdown", self.name);
    }

    // ---- channels ----

    pub(crate) fn register_channel(&self, channel: &Channel) {
        lock(&self.channels).insert(channel.id(), channel.clone());
        self.put_event(ConnectionEventType::Connect, channel);
        if self.is_shutdown() {
            self.close_channel(channel);
        }
    }

    pub(crate) fn put_event(&self, kind: ConnectionEventType, channel: &Channel) {
        let guard = self.event_pipe.read().unwrap_or_else(|e| e.into_inner());
        if let Some(pipe) = guard.as_ref() {
            pipe.put(ConnectionEvent { kind, remote_addr: channel.remote_addr(), channel: channel.clone() });
        }
    }

    /// Close `channel` once: pending requests on it fail with ConnectionClosed, then CLOSE.
    pub fn close_channel(&self, channel: &Channel) {
        if !channel.mark_closed() {
            return;
        }
        info!("{} close {:?}", self.name, channel);
        lock(&self.channels).remove(&channel.id());
        for fut in self.response_table.take_by_channel(channel.id()) {
            self.complete(&fut, Err(RemotingError::connection_closed(channel.remote_addr())));
        }
        self.put_event(ConnectionEventType::Close, channel);
    }

    // ---- completion ----

    /// Deliver the outcome of a pending request already removed from the table
    pub(crate) fn complete(&self, fut: &ResponseFuture, result: Result<Command, RemotingError>) {
        match fut.take_completion() {
            None => {}
            Some(Completion::Sync(tx)) => {
                let _ = tx.send(result);
            }
            Some(Completion::Async { callback, permit }) => {
                drop(permit);
                let id = fut.correlation_id();
                let job = move || run_callback(id, callback, result);
                if let Err(job) = self.callback_executor.try_run(job) {
                    warn!("{} callback executor busy, run callback of {} in place", self.name, id);
                    job();
                }
            }
        }
    }

    /// Fail every request past its deadline, returns how many
    pub fn scan_response_table(&self) -> usize {
        let expired = self.response_table.take_expired(Instant::now());
        let count = expired.len();
        for fut in expired {
            warn!("{} remove timeout request {:?}", self.name, fut);
            let err = fut.timeout_error();
            if catch_unwind(AssertUnwindSafe(|| self.complete(&fut, Err(err)))).is_err() {
                error!("{} complete {:?} panicked", self.name, fut);
            }
        }
        count
    }

    fn write_listener(self: &Arc<Self>, correlation_id: u64, channel: &Channel) -> WriteListener {
        let engine = Arc::downgrade(self);
        let addr = channel.remote_addr();
        Box::new(move |r| {
            let Err(e) = r else {
                return;
            };
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if let Some(fut) = engine.response_table.remove(correlation_id) {
                warn!("send request {} to {} failed: {}", correlation_id, addr, e);
                engine.complete(&fut, Err(RemotingError::send_failed(addr, e)));
            }
        })
    }

    #[inline]
    fn check_running(&self) -> Result<(), RemotingError> {
        if self.is_shutdown() {
            return Err(RemotingError::Shutdown);
        }
        Ok(())
    }

    // ---- invocation ----

    /// Send `request` and wait for its response, at most `timeout`.
    pub async fn invoke_sync(
        self: &Arc<Self>, channel: &Channel, mut request: Command, timeout: Duration,
    ) -> Result<Command, RemotingError> {
        self.check_running()?;
        let id = self.next_correlation_id();
        request.correlation_id = id;
        request.kind = CommandKind::Request;
        let (tx, mut rx) = oneshot::channel();
        self.response_table.insert(ResponseFuture::new(
            id,
            channel.id(),
            channel.remote_addr().to_string(),
            timeout,
            Completion::Sync(tx),
        ));
        let listener = self.write_listener(id, channel);
        if let Err(e) = channel.write(request, Some(listener)) {
            self.response_table.remove(id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => Err(RemotingError::connection_closed(channel.remote_addr())),
            Err(_) => {
                if let Some(fut) = self.response_table.remove(id) {
                    warn!("{} wait response of {:?} timeout", self.name, fut);
                    self.complete(&fut, Err(fut.timeout_error()));
                }
                // whoever removed the entry has filled rx
                match rx.await {
                    Ok(r) => r,
                    Err(_) => Err(RemotingError::Timeout {
                        addr: channel.remote_addr().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        }
    }

    /// Send `request` without waiting, `callback` gets the response or the failure exactly once.
    ///
    /// Fails with TooManyRequests when no async permit frees up in time, in which case
    /// nothing is sent and the callback is dropped uncalled. Same for an immediate send failure.
    pub async fn invoke_async<F>(
        self: &Arc<Self>, channel: &Channel, mut request: Command, timeout: Duration, callback: F,
    ) -> Result<(), RemotingError>
    where
        F: FnOnce(Result<Command, RemotingError>) + Send + 'static,
    {
        self.check_running()?;
        let permit = self.async_gate.acquire(self.config.permit_wait.min(timeout)).await?;
        let id = self.next_correlation_id();
        request.correlation_id = id;
        request.kind = CommandKind::Request;
        let callback: InvokeCallback = Box::new(callback);
        self.response_table.insert(ResponseFuture::new(
            id,
            channel.id(),
            channel.remote_addr().to_string(),
            timeout,
            Completion::Async { callback, permit },
        ));
        let listener = self.write_listener(id, channel);
        if let Err(e) = channel.write(request, Some(listener)) {
            if let Some(fut) = self.response_table.remove(id) {
                // releases the permit, the callback is never run
                drop(fut.take_completion());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Send `request` tagged one-way, no response is expected.
    ///
    /// The one-way permit is held until the command is written to the socket or dropped.
    pub async fn invoke_oneway(
        self: &Arc<Self>, channel: &Channel, mut request: Command, timeout: Duration,
    ) -> Result<(), RemotingError> {
        self.check_running()?;
        let permit = self.oneway_gate.acquire(self.config.permit_wait.min(timeout)).await?;
        request.correlation_id = self.next_correlation_id();
        request.mark_oneway();
        let addr = channel.remote_addr();
        let id = request.correlation_id;
        let listener: WriteListener = Box::new(move |r| {
            drop(permit);
            if let Err(e) = r {
                warn!("send oneway request {} to {} failed: {}", id, addr, e);
            }
        });
        channel.write(request, Some(listener))
    }

    // ---- dispatch ----

    /// Entry of every decoded command
    pub(crate) fn process_message_received(self: &Arc<Self>, channel: &Channel, cmd: Command) {
        match cmd.kind {
            CommandKind::Response => self.process_response(channel, cmd),
            CommandKind::Request | CommandKind::Oneway => self.process_request(channel, cmd),
        }
    }

    fn process_response(&self, channel: &Channel, response: Command) {
        match self.response_table.remove(response.correlation_id) {
            Some(fut) => self.complete(&fut, Ok(response)),
            None => {
                warn!(
                    "{} receive response, but not matched any request, {:?} from {}",
                    self.name,
                    response,
                    channel.remote_addr()
                );
            }
        }
    }

    fn process_request(self: &Arc<Self>, channel: &Channel, mut request: Command) {
        let oneway = request.is_oneway();
        let (opcode, id) = (request.opcode, request.correlation_id);
        let Some(pair) = self.lookup_processor(opcode) else {
            let remark = format!("request code {} not supported", opcode);
            warn!("{} {:?} {}", self.name, channel, remark);
            if !oneway {
                self.write_response(
                    channel,
                    sys_response(opcode, id, SysResponseCode::RequestCodeNotSupported, remark),
                );
            }
            return;
        };
        let hook = self.rpc_hook();
        if let Some(hook) = hook.as_ref() {
            if let Err(reason) = hook.before_request(channel.remote_addr(), &mut request) {
                warn!("{} {:?} rejected by rpc hook: {}", self.name, request, reason);
                if !oneway {
                    self.write_response(
                        channel,
                        sys_response(opcode, id, SysResponseCode::SystemError, reason),
                    );
                }
                return;
            }
        }
        if pair.processor.reject_request() {
            if !oneway {
                self.write_response(
                    channel,
                    sys_response(
                        opcode,
                        id,
                        SysResponseCode::SystemBusy,
                        "[REJECTREQUEST]system busy, start flow control for a while".to_string(),
                    ),
                );
            }
            return;
        }
        let job = self.clone().run_processor(channel.clone(), pair.processor.clone(), hook, request);
        if let Err(e) = pair.executor.execute(job) {
            warn!("{} too many requests and system thread pool busy: {}", self.name, e);
            if !oneway {
                self.write_response(
                    channel,
                    sys_response(
                        opcode,
                        id,
                        SysResponseCode::SystemBusy,
                        "[OVERLOAD]system busy, start flow control for a while".to_string(),
                    ),
                );
            }
        }
    }

    async fn run_processor(
        self: Arc<Self>, channel: Channel, processor: Arc<dyn RequestProcessor>,
        hook: Option<Arc<dyn RpcHook>>, request: Command,
    ) {
        let oneway = request.is_oneway();
        let (opcode, id) = (request.opcode, request.correlation_id);
        let hooked_request = hook.as_ref().map(|_| request.clone());
        let ctx = RequestContext::new(channel.clone());
        let r = AssertUnwindSafe(processor.process_request(&ctx, request)).catch_unwind().await;
        let mut response = match r {
            Ok(Ok(Some(mut response))) => {
                response.opcode = opcode;
                response.correlation_id = id;
                response.mark_response();
                response
            }
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                error!("{} process request opcode={} id={} error: {}", self.name, opcode, id, e);
                sys_response(opcode, id, SysResponseCode::SystemError, e.to_string())
            }
            Err(panic) => {
                let msg = panic_message(&*panic);
                error!("{} process request opcode={} id={} panic: {}", self.name, opcode, id, msg);
                sys_response(opcode, id, SysResponseCode::SystemError, msg)
            }
        };
        if oneway {
            if !response.is_success() {
                debug!("{} oneway request opcode={} id={} got {:?}", self.name, opcode, id, response);
            }
            return;
        }
        if let (Some(hook), Some(request)) = (hook.as_ref(), hooked_request.as_ref()) {
            hook.after_response(channel.remote_addr(), request, &mut response);
        }
        self.write_response(&channel, response);
    }

    /// Answer a request whose header fields could not be decoded
    pub(crate) fn reply_bad_header(
        &self, channel: &Channel, correlation_id: u64, opcode: i32, kind: CommandKind,
        reason: String,
    ) {
        if kind == CommandKind::Request {
            self.write_response(
                channel,
                sys_response(opcode, correlation_id, SysResponseCode::SystemError, reason),
            );
        } else if kind == CommandKind::Response {
            // the caller would only see a timeout otherwise
            if let Some(fut) = self.response_table.remove(correlation_id) {
                self.complete(&fut, Err(RemotingError::Protocol(reason)));
            }
        }
    }

    /// Queue `response`; if it can not be encoded, the requester gets SYSTEM_ERROR instead
    fn write_response(&self, channel: &Channel, response: Command) {
        let (name, opcode, id) = (self.name, response.opcode, response.correlation_id);
        let ch = channel.clone();
        let listener: WriteListener = Box::new(move |r| {
            let Err(e) = r else {
                return;
            };
            if e.kind() != io::ErrorKind::InvalidData {
                // the channel is going down, nothing can reach the peer
                return;
            }
            warn!("{} response of request {} opcode={} not sent: {}", name, id, opcode, e);
            let remark = format!("encode response failed: {}", e);
            if let Err(e) =
                ch.write(sys_response(opcode, id, SysResponseCode::SystemError, remark), None)
            {
                warn!("{} error response of request {} failed: {}", name, id, e);
            }
        });
        if let Err(e) = channel.write(response, Some(listener)) {
            warn!("{} process request over, but response failed: {}", self.name, e);
        }
    }
}

#[inline]
fn sys_response(opcode: i32, correlation_id: u64, code: SysResponseCode, remark: String) -> Command {
    let mut cmd = Command::response(code.code(), bytes::Bytes::new()).with_remark(remark);
    cmd.opcode = opcode;
    cmd.correlation_id = correlation_id;
    cmd
}

fn run_callback(id: u64, callback: InvokeCallback, result: Result<Command, RemotingError>) {
    if catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
        error!("callback of request {} panicked", id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("processor panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("processor panicked: {}", s)
    } else {
        "processor panicked".to_string()
    }
}
