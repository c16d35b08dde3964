use bytes::{BufMut, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Line-delimited JSON codec for the QMP protocol. Each message is one
/// JSON value terminated by a newline.
#[derive(Debug)]
pub struct QmpCodec;

impl QmpCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for QmpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for QmpCodec {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(newline_offset) = buf.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };

            let line = buf.split_to(newline_offset + 1);
            let json_bytes = &line[..line.len() - 1];

            // Skip blank lines some servers emit between messages
            if json_bytes.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return serde_json::from_slice(json_bytes).map(Some).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "invalid QMP line: {e} | content: {}",
                        String::from_utf8_lossy(json_bytes)
                    ),
                )
            });
        }
    }
}

impl Encoder<Value> for QmpCodec {
    type Error = io::Error;

    fn encode(&mut self, value: Value, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let json_bytes = serde_json::to_vec(&value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        buf.reserve(json_bytes.len() + 1);
        buf.put_slice(&json_bytes);
        buf.put_u8(b'\n');
        Ok(())
    }
}
