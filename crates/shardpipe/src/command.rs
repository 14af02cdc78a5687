//! Commands queued on a pipeline and the decoded replies they produce.

use bytes::Bytes;

/// A single store command: a name plus binary-safe arguments.
///
/// At most one argument is marked as the routing key; clustered pipelines
/// use it to pick the primary that owns the key's hash slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
    key_index: Option<usize>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            args: Vec::new(),
            key_index: None,
        }
    }

    /// Append a plain argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append an argument and, if none is marked yet, mark it as the routing key.
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        if self.key_index.is_none() {
            self.key_index = Some(self.args.len());
        }
        self.arg(key)
    }

    pub fn get(key: impl AsRef<[u8]>) -> Self {
        Self::new("GET").key(key)
    }

    pub fn set(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        Self::new("SET").key(key).arg(value)
    }

    pub fn del(key: impl AsRef<[u8]>) -> Self {
        Self::new("DEL").key(key)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn routing_key(&self) -> Option<&[u8]> {
        self.key_index
            .and_then(|idx| self.args.get(idx))
            .map(|b| b.as_ref())
    }

    /// First argument as text, for two-word commands such as `SCRIPT LOAD`.
    pub(crate) fn subcommand(&self) -> Option<String> {
        self.args
            .first()
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(str::to_ascii_uppercase)
    }
}

/// A decoded reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Nil,
    Int(i64),
    /// Raw bulk bytes.
    Bulk(Bytes),
    /// Bulk reply decoded to text (only with `decode_responses`).
    Text(String),
    /// Simple-string status reply such as `OK`.
    Status(String),
    Array(Vec<Value>),
    /// Per-command error reply; kept in the results unless the caller asks
    /// for raise-on-error.
    Error(String),
}

impl Value {
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bulk(b) => Some(b.as_ref()),
            Value::Text(s) | Value::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Text view of bulk, text or status replies.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bulk(b) => std::str::from_utf8(b).ok(),
            Value::Text(s) | Value::Status(s) => Some(s),
            _ => None,
        }
    }

    /// Integer replies, or numeric bulk/text replies (cursors are sent as bulk strings).
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(v) => u64::try_from(*v).ok(),
            other => other.as_str().and_then(|s| s.parse::<u64>().ok()),
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}
