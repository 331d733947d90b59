use std::fmt;

/// The kind of a [RemotingError], with a stable string name.
///
/// "remoting_" prefix is reserved for errors generated by the remoting layer itself.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    Eq,
    PartialOrd,
    Clone,
    Copy,
    Hash,
)]
#[repr(u8)]
pub enum ErrorKind {
    /// Writing the request to the socket failed, or the channel was already closed
    #[strum(serialize = "remoting_send_failed")]
    SendFailed = 0,
    /// No response within the deadline
    #[strum(serialize = "remoting_timeout")]
    Timeout = 1,
    /// Admission control denied a permit, the request was never sent
    #[strum(serialize = "remoting_too_many_requests")]
    TooManyRequests = 2,
    /// The channel closed while the request was pending
    #[strum(serialize = "remoting_connection_closed")]
    ConnectionClosed = 3,
    /// Establishing a connection failed
    #[strum(serialize = "remoting_connect_failed")]
    ConnectFailed = 4,
    /// Malformed frame or header
    #[strum(serialize = "remoting_protocol")]
    Protocol = 5,
    /// Listening socket could not be bound
    #[strum(serialize = "remoting_bind")]
    Bind = 6,
    /// The endpoint has been shut down
    #[strum(serialize = "remoting_shutdown")]
    Shutdown = 7,
}

// The default Debug derive ignores the strum customized string
impl fmt::Debug for ErrorKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Failure surfaced to callers of the remoting API.
///
/// Sync callers receive it as the `Err` of their call, async callers through their callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemotingError {
    #[error("send request to {addr} failed: {reason}")]
    SendFailed { addr: String, reason: String },

    #[error("wait response from {addr} timeout after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    #[error("too many requests: {0}")]
    TooManyRequests(String),

    #[error("connection to {addr} closed")]
    ConnectionClosed { addr: String },

    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bind {addr} failed: {reason}")]
    Bind { addr: String, reason: String },

    #[error("remoting endpoint is shut down")]
    Shutdown,
}

impl RemotingError {
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SendFailed { .. } => ErrorKind::SendFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::TooManyRequests(_) => ErrorKind::TooManyRequests,
            Self::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            Self::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Bind { .. } => ErrorKind::Bind,
            Self::Shutdown => ErrorKind::Shutdown,
        }
    }

    #[inline]
    pub fn send_failed(addr: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::SendFailed { addr: addr.to_string(), reason: reason.to_string() }
    }

    #[inline]
    pub fn connection_closed(addr: impl fmt::Display) -> Self {
        Self::ConnectionClosed { addr: addr.to_string() }
    }
}

impl std::cmp::PartialEq<ErrorKind> for RemotingError {
    #[inline]
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind() == *other
    }
}

/// Error returned by a request processor, converted into a SYSTEM_ERROR response.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync + 'static>;
