#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # broker-remoting
//!
//! Request/response multiplexing over long-lived TCP connections, the transport layer of a
//! message broker.
//!
//! Both ends run the same [RemotingEngine]: a command is either a request (answered with a
//! response carrying the same correlation id), a one-way request, or a response. On top of it
//! [RemotingServer] accepts connections and [RemotingClient] dials them by address.
//!
//! ## Components
//!
//! - [`broker-remoting-core`](broker_remoting_core): commands, errors, config.
//! - [`broker-remoting-codec`](broker_remoting_codec): serialization of the header fields.
//!
//! ## Invocation modes
//!
//! - [RemotingEngine::invoke_sync]: wait for the response up to a timeout.
//! - [RemotingEngine::invoke_async]: the callback receives the response or the failure once.
//!   Bounded by the async gate.
//! - [RemotingEngine::invoke_oneway]: fire and forget. Bounded by the one-way gate.

#[macro_use]
extern crate log;

pub mod channel;
pub mod client;
pub mod event;
pub mod executor;
pub mod processor;
pub mod proto;
pub mod remoting;
pub mod response;
pub mod server;
pub mod throttler;
mod timer;

pub use broker_remoting_core::error;
pub use broker_remoting_core::{
    ClientConfig, Command, CommandKind, RemotingConfig, ServerConfig, SysResponseCode,
    TimeoutSetting,
};
pub use channel::Channel;
pub use client::RemotingClient;
pub use event::{ChannelEventListener, ConnectionEvent, ConnectionEventType};
pub use executor::{RejectedExecution, WorkerPool};
pub use processor::{ProcessorFn, RequestContext, RequestProcessor, RpcHook, processor_fn};
pub use remoting::RemotingEngine;
pub use response::InvokeCallback;
pub use server::RemotingServer;
