//! Error types shared by the registry, pipelines and transports.

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipeError>;

/// Errors surfaced by this crate.
///
/// Configuration errors (`InvalidPipeline`, `AlreadyConnected`) are raised at
/// registration time. Scan-iteration errors (`ShardIndexOutOfRange`,
/// `CursorOverflow`) surface mid-iteration and require restarting the scan
/// from cursor `0`. Transport and server errors are passed through untouched.
#[derive(Debug, Error)]
pub enum PipeError {
    /// A connection name was used without being registered, or a client
    /// failed a registration precondition.
    #[error("{}: {reason}", display_name(.name.as_deref()))]
    InvalidPipeline {
        /// Connection name (`None` is the default connection).
        name: Option<String>,
        /// What was wrong.
        reason: String,
    },

    /// A name is already bound to a different connection target.
    #[error("can't change connection for {}", display_name(.name.as_deref()))]
    AlreadyConnected {
        /// Connection name (`None` is the default connection).
        name: Option<String>,
    },

    /// A connection URL could not be parsed.
    #[error("invalid connection url {url:?}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// What was wrong.
        reason: String,
    },

    /// A virtual cursor points past the end of the current topology.
    #[error("shard index {shard_index} out of range for {shards} primaries")]
    ShardIndexOutOfRange {
        /// Shard index decoded from the cursor.
        shard_index: usize,
        /// Number of primaries in the current snapshot.
        shards: usize,
    },

    /// A shard returned a native cursor wider than 48 bits.
    #[error("native cursor {cursor} does not fit in 48 bits")]
    CursorOverflow {
        /// The native cursor returned by the shard.
        cursor: u64,
    },

    /// A shard index does not fit in the 16 bits above the native cursor.
    #[error("shard index {shard_index} does not fit in a virtual cursor")]
    ShardIndexOverflow {
        /// The shard index being encoded.
        shard_index: usize,
    },

    /// The topology source reported no primaries.
    #[error("cluster topology has no primaries")]
    EmptyTopology,

    /// No primary in the current snapshot serves this hash slot.
    #[error("no primary owns hash slot {slot}")]
    SlotUnowned {
        /// Hash slot of the routed key.
        slot: u16,
    },

    /// A record operation would break the record's schema.
    #[error("record {key:?}: {reason}")]
    InvalidRecord {
        /// Record key, without the keyspace.
        key: String,
        /// What was wrong.
        reason: String,
    },

    /// Network I/O failure.
    #[error("I/O error talking to {addr}: {source}")]
    Io {
        /// Node address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Connect or read/write deadline exceeded.
    #[error("{operation} timed out for {addr}")]
    Timeout {
        /// What was being done.
        operation: &'static str,
        /// Node address.
        addr: String,
    },

    /// Malformed or unexpected RESP data.
    #[error("protocol error: {message}")]
    Protocol {
        /// Error description.
        message: String,
    },

    /// The store answered a command with an error reply.
    #[error("server error: {0}")]
    Server(String),
}

impl PipeError {
    pub(crate) fn invalid(name: Option<&str>, reason: impl Into<String>) -> Self {
        Self::InvalidPipeline {
            name: name.map(str::to_owned),
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

/// Render a connection name for messages; the unnamed connection is "default".
pub fn display_name(name: Option<&str>) -> &str {
    name.unwrap_or("default")
}
