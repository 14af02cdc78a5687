//! RESP2 framing for commands and replies.

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;

use crate::command::{Command, Value};
use crate::error::{PipeError, Result};

/// Build the RESP array frame for a command.
pub fn encode_command(cmd: &Command) -> BytesFrame {
    let mut parts = Vec::with_capacity(cmd.args().len() + 1);
    parts.push(BytesFrame::BulkString(Bytes::copy_from_slice(
        cmd.name().as_bytes(),
    )));
    parts.extend(cmd.args().iter().cloned().map(BytesFrame::BulkString));
    BytesFrame::Array(parts)
}

/// Decode a reply frame. With `decode_text`, bulk strings become [`Value::Text`]
/// and non-UTF-8 payloads are a protocol error.
pub fn decode_frame(frame: BytesFrame, decode_text: bool) -> Result<Value> {
    let value = match frame {
        BytesFrame::SimpleString(b) => Value::Status(String::from_utf8_lossy(&b).into_owned()),
        BytesFrame::Error(err) => Value::Error(err.to_string()),
        BytesFrame::Integer(v) => Value::Int(v),
        BytesFrame::BulkString(b) if decode_text => Value::Text(
            String::from_utf8(b.to_vec())
                .map_err(|_| PipeError::protocol("bulk reply is not valid UTF-8"))?,
        ),
        BytesFrame::BulkString(b) => Value::Bulk(b),
        BytesFrame::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| decode_frame(item, decode_text))
                .collect::<Result<Vec<_>>>()?,
        ),
        BytesFrame::Null => Value::Nil,
    };
    Ok(value)
}
