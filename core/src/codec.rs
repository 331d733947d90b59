use serde::{Deserialize, Serialize};

/// Serialization failure of the structured header section
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// Serializes the header fields (remark and extension fields) of a frame.
///
/// Implementations live in [broker-remoting-codec](../broker_remoting_codec/index.html).
/// A codec is shared by every connection of an engine and must be stateless.
pub trait Codec: Default + Send + Sync + Sized + 'static {
    /// Serialize the fields after whatever `buf` already holds, returning the bytes appended.
    /// On error `buf` is restored to its original length.
    fn encode_into<T: Serialize>(&self, fields: &T, buf: &mut Vec<u8>) -> Result<usize, CodecError>;

    /// The whole of `buf` must be consumed, trailing bytes count as corruption
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, CodecError>;
}
