//! Connection parameters and environment-driven knobs.

use std::env;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use percent_encoding::percent_decode_str;

use crate::error::{PipeError, Result};

/// Default RESP port.
pub const DEFAULT_PORT: u16 = 6379;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_IDLE_PER_NODE: usize = 4;

/// Network and auth parameters of a store connection.
///
/// Two clients with equal parameters are considered the same connection
/// target; the registry relies on this to reject rebinding a name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_name: Option<String>,
    /// Decode bulk replies into text instead of returning raw bytes.
    pub decode_responses: bool,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            db: 0,
            username: None,
            password: None,
            client_name: None,
            decode_responses: false,
        }
    }

    /// Parse `redis://[user[:password]@]host[:port][/db][?decode_responses=true&client_name=x]`.
    pub fn from_url(url: &str) -> Result<Self> {
        let bad = |reason: &str| PipeError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| bad("expected redis:// scheme"))?;
        let (rest, query) = match rest.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| bad("invalid port"))?;
                (host, port)
            }
            None => (hostport, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(bad("missing host"));
        }

        let mut params = Self::new(host, port);
        if let Some(userinfo) = userinfo {
            let (user, password) = match userinfo.split_once(':') {
                Some((user, password)) => (user, Some(password)),
                None => (userinfo, None),
            };
            let decode = |part: &str| {
                percent_decode_str(part)
                    .decode_utf8()
                    .map(|decoded| decoded.into_owned())
                    .map_err(|_| bad("userinfo is not valid UTF-8 after percent-decoding"))
            };
            params.username = match user {
                "" => None,
                user => Some(decode(user)?),
            };
            params.password = password.map(decode).transpose()?;
        }
        if !path.is_empty() {
            params.db = path.parse::<u32>().map_err(|_| bad("invalid db index"))?;
        }

        for pair in query
            .unwrap_or_default()
            .split('&')
            .filter(|p| !p.is_empty())
        {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "decode_responses" => params.decode_responses = parse_flag(value),
                "client_name" => params.client_name = Some(value.to_string()),
                "db" => params.db = value.parse::<u32>().map_err(|_| bad("invalid db index"))?,
                other => {
                    tracing::debug!(option = other, "ignoring unknown connection url option");
                }
            }
        }
        Ok(params)
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Keep the password out of logs.
impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_name", &self.client_name)
            .field("decode_responses", &self.decode_responses)
            .finish()
    }
}

/// Timeouts and pooling for [`crate::transport::TcpTransport`].
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_idle_per_node: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            max_idle_per_node: DEFAULT_MAX_IDLE_PER_NODE,
        }
    }
}

impl TransportConfig {
    /// Defaults overridden by `SHARDPIPE_CONNECT_TIMEOUT_MS`,
    /// `SHARDPIPE_IO_TIMEOUT_MS` and `SHARDPIPE_MAX_IDLE_CONNS`.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: Duration::from_millis(read_env_u64(
                "SHARDPIPE_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )),
            io_timeout: Duration::from_millis(read_env_u64(
                "SHARDPIPE_IO_TIMEOUT_MS",
                DEFAULT_IO_TIMEOUT_MS,
            )),
            max_idle_per_node: read_env_u64(
                "SHARDPIPE_MAX_IDLE_CONNS",
                DEFAULT_MAX_IDLE_PER_NODE as u64,
            ) as usize,
        }
    }
}

/// Whether per-operation result-consumption stats are collected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsConfig {
    pub enabled: bool,
}

impl StatsConfig {
    /// Reads `SHARDPIPE_STATS` once per process; later changes to the
    /// environment are not observed.
    pub fn from_env() -> Self {
        static ENABLED: OnceLock<bool> = OnceLock::new();
        let enabled = *ENABLED.get_or_init(|| {
            env::var("SHARDPIPE_STATS")
                .map(|v| v == "true")
                .unwrap_or(false)
        });
        Self { enabled }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
