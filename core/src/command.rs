//! The unit of RPC exchange between two peers.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Flag bit marking a response on the wire
pub const FLAG_RESPONSE: u8 = 1;
/// Flag bit marking a one-way request on the wire
pub const FLAG_ONEWAY: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Request,
    Response,
    Oneway,
}

impl CommandKind {
    #[inline]
    pub fn from_flag(flag: u8) -> Self {
        if flag & FLAG_RESPONSE != 0 {
            Self::Response
        } else if flag & FLAG_ONEWAY != 0 {
            Self::Oneway
        } else {
            Self::Request
        }
    }

    #[inline]
    pub fn flag(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => FLAG_RESPONSE,
            Self::Oneway => FLAG_ONEWAY,
        }
    }
}

/// Status codes reserved by the remoting layer, carried in [Command::status] of a response.
///
/// Any other value is an application defined code.
#[derive(
    strum::Display, strum::AsRefStr, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Hash,
)]
#[repr(i32)]
pub enum SysResponseCode {
    #[strum(serialize = "success")]
    Success = 0,
    /// Processor failed or a hook rejected the request
    #[strum(serialize = "system_error")]
    SystemError = 1,
    /// Processor rejected the request or its executor is saturated
    #[strum(serialize = "system_busy")]
    SystemBusy = 2,
    /// No processor registered for the opcode and no default processor
    #[strum(serialize = "request_code_not_supported")]
    RequestCodeNotSupported = 3,
}

impl SysResponseCode {
    #[inline(always)]
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::SystemError),
            2 => Some(Self::SystemBusy),
            3 => Some(Self::RequestCodeNotSupported),
            _ => None,
        }
    }
}

/// A request, response or one-way command.
///
/// `correlation_id` is assigned by the engine when a request is sent, and copied into the
/// response so the sender can match them.
#[derive(Clone, PartialEq)]
pub struct Command {
    pub opcode: i32,
    pub correlation_id: u64,
    pub kind: CommandKind,
    pub status: i32,
    pub remark: Option<String>,
    /// Structured custom header fields
    pub ext_fields: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Command {
    /// A new request for `opcode`
    pub fn request(opcode: i32, body: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            correlation_id: 0,
            kind: CommandKind::Request,
            status: SysResponseCode::Success.code(),
            remark: None,
            ext_fields: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// A new one-way request for `opcode`, no response will be produced
    pub fn oneway(opcode: i32, body: impl Into<Bytes>) -> Self {
        let mut cmd = Self::request(opcode, body);
        cmd.kind = CommandKind::Oneway;
        cmd
    }

    /// A response with `status` to be sent back for `request`
    pub fn response_to(request: &Command, status: i32, remark: Option<String>) -> Self {
        Self {
            opcode: request.opcode,
            correlation_id: request.correlation_id,
            kind: CommandKind::Response,
            status,
            remark,
            ext_fields: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    /// A response without any request to copy from, the engine fills in opcode and id
    pub fn response(status: i32, body: impl Into<Bytes>) -> Self {
        Self {
            opcode: 0,
            correlation_id: 0,
            kind: CommandKind::Response,
            status,
            remark: None,
            ext_fields: BTreeMap::new(),
            body: body.into(),
        }
    }

    #[inline]
    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    #[inline]
    pub fn with_ext_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext_fields.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn ext_field(&self, key: &str) -> Option<&str> {
        self.ext_fields.get(key).map(|v| v.as_str())
    }

    #[inline(always)]
    pub fn is_response(&self) -> bool {
        self.kind == CommandKind::Response
    }

    #[inline(always)]
    pub fn is_oneway(&self) -> bool {
        self.kind == CommandKind::Oneway
    }

    #[inline]
    pub fn mark_oneway(&mut self) {
        self.kind = CommandKind::Oneway;
    }

    #[inline]
    pub fn mark_response(&mut self) {
        self.kind = CommandKind::Response;
    }

    /// The status as a system code, None for application defined codes
    #[inline]
    pub fn sys_code(&self) -> Option<SysResponseCode> {
        SysResponseCode::from_code(self.status)
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == SysResponseCode::Success.code()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cmd(kind={:?}, opcode={}, id={}, status={}, body={}",
            self.kind,
            self.opcode,
            self.correlation_id,
            self.status,
            self.body.len()
        )?;
        if let Some(remark) = self.remark.as_ref() {
            write!(f, ", remark={:?}", remark)?;
        }
        write!(f, ")")
    }
}
