use crate::{Codec, CodecError};
use serde::{Deserialize, Serialize};

/// MessagePack with named fields, so either side may add header fields without breaking the other
#[derive(Default, Clone, Copy, Debug)]
pub struct MsgpCodec;

impl Codec for MsgpCodec {
    fn encode_into<T: Serialize>(&self, fields: &T, buf: &mut Vec<u8>) -> Result<usize, CodecError> {
        let pre_len = buf.len();
        match rmp_serde::encode::write_named(buf, fields) {
            Ok(()) => Ok(buf.len() - pre_len),
            Err(e) => {
                buf.truncate(pre_len);
                log::error!("msgpack encode header fields: {:?}", e);
                Err(CodecError::Encode(e.to_string()))
            }
        }
    }

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, CodecError> {
        let mut cursor = std::io::Cursor::new(buf);
        let fields = T::deserialize(&mut rmp_serde::Deserializer::new(&mut cursor)).map_err(|e| {
            log::warn!("msgpack decode header fields: {:?}", e);
            CodecError::Decode(e.to_string())
        })?;
        let left = buf.len() - cursor.position() as usize;
        if left > 0 {
            return Err(CodecError::Decode(format!("{} trailing bytes", left)));
        }
        Ok(fields)
    }
}
