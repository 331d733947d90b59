//! # broker-remoting-codec
//!
//! This crate provides [broker_remoting_core::Codec] implementations, used by the frame codec of
//! [`broker-remoting`] to serialize the structured header section of a command.
//! It supports `msgpack`.

pub use broker_remoting_core::{Codec, CodecError};
#[cfg(feature = "msgpack")]
mod msgpack;
#[cfg(feature = "msgpack")]
pub use msgpack::*;
