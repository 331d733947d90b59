use crate::channel::Channel;
use crate::executor::WorkerPool;
use broker_remoting_core::{Command, error::ProcessError};
use futures::future::BoxFuture;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

/// What a processor sees about the request besides the command itself
pub struct RequestContext {
    channel: Channel,
}

impl RequestContext {
    #[inline]
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// The connection the request came from
    #[inline(always)]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[inline(always)]
    pub fn remote_addr(&self) -> SocketAddr {
        self.channel.remote_addr()
    }
}

/// Handles requests of the opcodes it is registered for.
///
/// `process_request` runs on the executor registered with the processor. Returning `Ok(None)`
/// sends nothing back, `Err` is answered with SYSTEM_ERROR. For one-way requests the result is
/// only logged.
pub trait RequestProcessor: Send + Sync + 'static {
    fn process_request<'a>(
        &'a self, ctx: &'a RequestContext, request: Command,
    ) -> BoxFuture<'a, Result<Option<Command>, ProcessError>>;

    /// Checked before a request is submitted, true answers SYSTEM_BUSY right away.
    fn reject_request(&self) -> bool {
        false
    }
}

/// A processor bound to the executor it runs on
#[derive(Clone)]
pub struct ProcessorPair {
    pub processor: Arc<dyn RequestProcessor>,
    pub executor: WorkerPool,
}

impl ProcessorPair {
    #[inline]
    pub fn new(processor: Arc<dyn RequestProcessor>, executor: WorkerPool) -> Self {
        Self { processor, executor }
    }
}

/// A [RequestProcessor] from a closure, handy for tests and small handlers.
///
/// # Example
///
/// ```no_compile,ignore
/// let echo = processor_fn(|req: Command| async move {
///     Ok(Some(Command::response(0, req.body)))
/// });
/// server.register_processor(10, echo, None);
/// ```
pub struct ProcessorFn<H, F> {
    handle: H,
    _phan: PhantomData<fn() -> F>,
}

pub fn processor_fn<H, F>(handle: H) -> ProcessorFn<H, F>
where
    H: Fn(Command) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Option<Command>, ProcessError>> + Send + 'static,
{
    ProcessorFn { handle, _phan: Default::default() }
}

impl<H, F> RequestProcessor for ProcessorFn<H, F>
where
    H: Fn(Command) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Option<Command>, ProcessError>> + Send + 'static,
{
    #[inline]
    fn process_request<'a>(
        &'a self, _ctx: &'a RequestContext, request: Command,
    ) -> BoxFuture<'a, Result<Option<Command>, ProcessError>> {
        Box::pin((self.handle)(request))
    }
}

/// Interceptor around request dispatching.
pub trait RpcHook: Send + Sync + 'static {
    /// Called before a request reaches its processor, may rewrite it.
    ///
    /// Err rejects the request, a SYSTEM_ERROR response carrying the reason is sent back.
    fn before_request(&self, remote_addr: SocketAddr, request: &mut Command) -> Result<(), String>;

    /// Called on a response produced by a processor, before it is written.
    fn after_response(&self, _remote_addr: SocketAddr, _request: &Command, _response: &mut Command) {}
}
