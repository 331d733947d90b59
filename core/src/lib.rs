//! # broker-remoting-core
//!
//! This crate provides the core types shared by [`broker-remoting`] and its codec crate:
//! the [Command] exchanged between peers, the error taxonomy, configuration, and the
//! [Codec] interface used to serialize structured header fields.

mod codec;
pub use codec::{Codec, CodecError};
mod config;
pub use config::*;
pub mod command;
pub use command::{Command, CommandKind, SysResponseCode};
pub mod error;
