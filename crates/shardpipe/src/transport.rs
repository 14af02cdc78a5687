//! Node transport: one batched request/response exchange with a single node.
//!
//! Pipelines are transport-agnostic; [`TcpTransport`] speaks RESP2 over
//! pooled TCP connections, and tests substitute in-memory implementations.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;

use crate::command::{Command, Value};
use crate::config::{ConnectionParams, TransportConfig};
use crate::error::{PipeError, Result};
use crate::resp::{decode_frame, encode_command};

/// Sends a batch of commands to one node in a single round trip.
#[async_trait]
pub trait NodeTransport: Send + Sync + 'static {
    /// Write every command, then read exactly one reply per command, in order.
    ///
    /// Error replies are returned as [`Value::Error`]; only I/O and protocol
    /// failures fail the whole call.
    async fn round_trip(
        &self,
        addr: &str,
        params: &ConnectionParams,
        commands: &[Command],
    ) -> Result<Vec<Value>>;
}

type RespConn = Framed<TcpStream, Resp2>;

/// RESP2 over TCP with a small per-node idle connection pool.
pub struct TcpTransport {
    config: TransportConfig,
    idle: Mutex<HashMap<(String, ConnectionParams), Vec<RespConn>>>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    async fn checkout(&self, addr: &str, params: &ConnectionParams) -> Result<RespConn> {
        let pooled = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.get_mut(&(addr.to_string(), params.clone()))
                .and_then(Vec::pop)
        };
        if let Some(conn) = pooled {
            return Ok(conn);
        }

        let socket = time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PipeError::Timeout {
                operation: "connect",
                addr: addr.to_string(),
            })?
            .map_err(|source| PipeError::Io {
                addr: addr.to_string(),
                source,
            })?;
        socket.set_nodelay(true).ok();
        let mut conn = Framed::new(socket, Resp2::default());
        self.handshake(&mut conn, addr, params).await?;
        tracing::debug!(node = %addr, "opened store connection");
        Ok(conn)
    }

    fn checkin(&self, addr: &str, params: &ConnectionParams, conn: RespConn) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = idle
            .entry((addr.to_string(), params.clone()))
            .or_default();
        if slot.len() < self.config.max_idle_per_node {
            slot.push(conn);
        }
    }

    /// AUTH / SELECT / CLIENT SETNAME on a fresh connection.
    async fn handshake(
        &self,
        conn: &mut RespConn,
        addr: &str,
        params: &ConnectionParams,
    ) -> Result<()> {
        let mut setup = Vec::new();
        if let Some(password) = &params.password {
            let mut auth = Command::new("AUTH");
            if let Some(user) = &params.username {
                auth = auth.arg(user);
            }
            setup.push(auth.arg(password));
        }
        if params.db != 0 {
            setup.push(Command::new("SELECT").arg(params.db.to_string()));
        }
        if let Some(name) = &params.client_name {
            setup.push(Command::new("CLIENT").arg("SETNAME").arg(name));
        }
        if setup.is_empty() {
            return Ok(());
        }

        let frames = setup.iter().map(encode_command).collect();
        for frame in self.exchange(conn, addr, frames).await? {
            if let BytesFrame::Error(err) = frame {
                return Err(PipeError::Server(err.to_string()));
            }
        }
        Ok(())
    }

    async fn exchange(
        &self,
        conn: &mut RespConn,
        addr: &str,
        frames: Vec<BytesFrame>,
    ) -> Result<Vec<BytesFrame>> {
        let expected = frames.len();
        let io = async {
            for frame in frames {
                conn.feed(frame).await.map_err(|err| protocol_err(addr, err))?;
            }
            <RespConn as SinkExt<BytesFrame>>::flush(conn)
                .await
                .map_err(|err| protocol_err(addr, err))?;

            let mut replies = Vec::with_capacity(expected);
            while replies.len() < expected {
                match conn.next().await {
                    Some(Ok(frame)) => replies.push(frame),
                    Some(Err(err)) => return Err(protocol_err(addr, err)),
                    None => {
                        return Err(PipeError::Io {
                            addr: addr.to_string(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "connection closed mid-pipeline",
                            ),
                        })
                    }
                }
            }
            Ok::<_, PipeError>(replies)
        };

        time::timeout(self.config.io_timeout, io)
            .await
            .map_err(|_| PipeError::Timeout {
                operation: "pipeline round trip",
                addr: addr.to_string(),
            })?
    }
}

fn protocol_err(addr: &str, err: impl std::fmt::Display) -> PipeError {
    PipeError::Protocol {
        message: format!("{addr}: {err}"),
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(TransportConfig::from_env())
    }
}

#[async_trait]
impl NodeTransport for TcpTransport {
    async fn round_trip(
        &self,
        addr: &str,
        params: &ConnectionParams,
        commands: &[Command],
    ) -> Result<Vec<Value>> {
        let mut conn = self.checkout(addr, params).await?;
        let frames = commands.iter().map(encode_command).collect();
        // A connection that failed mid-exchange may hold unread replies; drop it.
        let replies = self.exchange(&mut conn, addr, frames).await?;
        self.checkin(addr, params, conn);

        replies
            .into_iter()
            .map(|frame| decode_frame(frame, params.decode_responses))
            .collect()
    }
}
