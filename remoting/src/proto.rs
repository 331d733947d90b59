//! Wire format of a [Command].
//!
//! Every command is one length-prefixed frame:
//!
//! | 4B        | 28B head | ext_len | body_len |
//! | frame_len | CmdHead  | ext     | body     |
//!
//! `frame_len` counts everything after itself. The head is big endian:
//!
//! | 2B   |1B | 1B   | 4B     | 4B     | 8B             | 4B      | 4B       |
//! | magic|ver| flag | opcode | status | correlation_id | ext_len | body_len |
//!
//! The ext section is the msgpack encoded remark and custom header fields, omitted (ext_len=0)
//! when both are empty.

use broker_remoting_codec::MsgpCodec;
use broker_remoting_core::{Codec, Command, CommandKind, error::RemotingError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::mem::size_of;
use zerocopy::byteorder::{BigEndian, I32, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const CMD_MAGIC: [u8; 2] = [b'R', b'M'];
pub const CMD_VERSION: u8 = 1;

const LEN_PREFIX: usize = size_of::<u32>();

#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, PartialEq, Clone, Copy)]
#[repr(C)]
pub struct CmdHead {
    pub magic: [u8; 2],
    pub ver: u8,
    /// see [broker_remoting_core::command::FLAG_RESPONSE]
    pub flag: u8,
    pub opcode: I32<BigEndian>,
    pub status: I32<BigEndian>,
    pub correlation_id: U64<BigEndian>,
    pub ext_len: U32<BigEndian>,
    pub body_len: U32<BigEndian>,
}

pub const CMD_HEADER_LEN: usize = size_of::<CmdHead>();

impl fmt::Debug for CmdHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[flag:{}, opcode:{}, id:{}, status:{}, ext:{}, body:{}]",
            self.flag,
            self.opcode.get(),
            self.correlation_id.get(),
            self.status.get(),
            self.ext_len.get(),
            self.body_len.get()
        )
    }
}

#[derive(Serialize)]
struct ExtFieldsRef<'a> {
    remark: &'a Option<String>,
    ext_fields: &'a BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
struct ExtFields {
    #[serde(default)]
    remark: Option<String>,
    #[serde(default)]
    ext_fields: BTreeMap<String, String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Framing is broken, the rest of the stream can not be trusted
    #[error("corrupted frame: {0}")]
    Corrupted(String),
    /// The frame boundary is intact but its ext section is unreadable
    #[error("bad header of {kind:?} id={correlation_id} opcode={opcode}: {reason}")]
    Header { correlation_id: u64, opcode: i32, kind: CommandKind, reason: String },
}

/// Encodes commands into frames and splits frames out of a read buffer.
pub struct FrameCodec {
    codec: MsgpCodec,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { codec: MsgpCodec, max_frame_len }
    }

    pub fn encode(&self, cmd: &Command, dst: &mut BytesMut) -> Result<(), RemotingError> {
        let mut ext = Vec::new();
        if cmd.remark.is_some() || !cmd.ext_fields.is_empty() {
            let fields = ExtFieldsRef { remark: &cmd.remark, ext_fields: &cmd.ext_fields };
            if let Err(e) = self.codec.encode_into(&fields, &mut ext) {
                return Err(RemotingError::Protocol(format!("{:?}: {}", cmd, e)));
            }
        }
        let frame_len = CMD_HEADER_LEN + ext.len() + cmd.body.len();
        if frame_len > self.max_frame_len {
            return Err(RemotingError::Protocol(format!(
                "frame of {:?} is {} bytes, exceeds {}",
                cmd, frame_len, self.max_frame_len
            )));
        }
        let head = CmdHead {
            magic: CMD_MAGIC,
            ver: CMD_VERSION,
            flag: cmd.kind.flag(),
            opcode: I32::new(cmd.opcode),
            status: I32::new(cmd.status),
            correlation_id: U64::new(cmd.correlation_id),
            ext_len: U32::new(ext.len() as u32),
            body_len: U32::new(cmd.body.len() as u32),
        };
        dst.reserve(LEN_PREFIX + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_slice(head.as_bytes());
        dst.put_slice(&ext);
        dst.put_slice(&cmd.body);
        Ok(())
    }

    /// Split one command off the front of `src`.
    ///
    /// Returns Ok(None) when `src` does not hold a whole frame yet. On [DecodeError::Header] the
    /// frame has been consumed and decoding may continue.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Command>, DecodeError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len < CMD_HEADER_LEN || frame_len > self.max_frame_len {
            return Err(DecodeError::Corrupted(format!("invalid frame_len {}", frame_len)));
        }
        if src.len() < LEN_PREFIX + frame_len {
            src.reserve(LEN_PREFIX + frame_len - src.len());
            return Ok(None);
        }
        let head = match CmdHead::read_from_prefix(&src[LEN_PREFIX..]) {
            Some(head) => head,
            None => return Err(DecodeError::Corrupted("short head".to_string())),
        };
        if head.magic != CMD_MAGIC {
            return Err(DecodeError::Corrupted(format!("wrong magic {:?}", head.magic)));
        }
        if head.ver != CMD_VERSION {
            return Err(DecodeError::Corrupted(format!("version {} not supported", head.ver)));
        }
        let ext_len = head.ext_len.get() as usize;
        let body_len = head.body_len.get() as usize;
        if CMD_HEADER_LEN + ext_len + body_len != frame_len {
            return Err(DecodeError::Corrupted(format!(
                "length mismatch {:?} frame_len {}",
                head, frame_len
            )));
        }
        src.advance(LEN_PREFIX + CMD_HEADER_LEN);
        let ext = src.split_to(ext_len);
        let body = src.split_to(body_len).freeze();
        let kind = CommandKind::from_flag(head.flag);
        let fields = if ext_len == 0 {
            ExtFields::default()
        } else {
            match self.codec.decode::<ExtFields>(&ext) {
                Ok(fields) => fields,
                Err(e) => {
                    return Err(DecodeError::Header {
                        correlation_id: head.correlation_id.get(),
                        opcode: head.opcode.get(),
                        kind,
                        reason: format!("header fields: {}", e),
                    });
                }
            }
        };
        Ok(Some(Command {
            opcode: head.opcode.get(),
            correlation_id: head.correlation_id.get(),
            kind,
            status: head.status.get(),
            remark: fields.remark,
            ext_fields: fields.ext_fields,
            body,
        }))
    }
}
