//! Shared helpers for integration tests: an in-memory sharded store that
//! stands in for the network, and a RESP server backed by the same store.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use shardpipe::{
    ClientHandle, ClusterClient, ClusterNode, Command, ConnectionParams, NodeTransport, PipeError,
    ScanOptions, StaticTopology, Value,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

const DEFAULT_SCAN_COUNT: usize = 10;

/// MULTI/EXEC state of one client connection.
#[derive(Default)]
pub struct Session {
    queued: Option<Vec<Command>>,
}

/// One store node holding keys in sorted order.
pub struct MemoryNode {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    hashes: Mutex<BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>>,
    ttls: Mutex<HashMap<Vec<u8>, i64>>,
    scripts: Mutex<HashMap<String, String>>,
    failure: Mutex<Option<String>>,
    /// Multiplier applied to native scan cursors, to exercise wide cursors.
    cursor_scale: u64,
}

impl Default for MemoryNode {
    fn default() -> Self {
        Self::with_cursor_scale(1)
    }
}

impl MemoryNode {
    pub fn with_cursor_scale(cursor_scale: u64) -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            hashes: Mutex::new(BTreeMap::new()),
            ttls: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            cursor_scale,
        }
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.data
            .lock()
            .unwrap()
            .insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
    }

    pub fn keys(&self) -> Vec<String> {
        self.data
            .lock()
            .unwrap()
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    /// Fields of the hash at `key`, as text.
    pub fn hash(&self, key: &str) -> BTreeMap<String, String> {
        self.hashes
            .lock()
            .unwrap()
            .get(key.as_bytes())
            .map(|fields| {
                fields
                    .iter()
                    .map(|(f, v)| {
                        (
                            String::from_utf8_lossy(f).into_owned(),
                            String::from_utf8_lossy(v).into_owned(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn insert_hash(&self, key: &str, fields: &[(&str, &str)]) {
        let mut hashes = self.hashes.lock().unwrap();
        let hash = hashes.entry(key.as_bytes().to_vec()).or_default();
        for (field, value) in fields {
            hash.insert(field.as_bytes().to_vec(), value.as_bytes().to_vec());
        }
    }

    /// Seconds set by the last EXPIRE on `key`.
    pub fn ttl(&self, key: &str) -> Option<i64> {
        self.ttls.lock().unwrap().get(key.as_bytes()).copied()
    }

    pub fn has_script(&self, sha: &str) -> bool {
        self.scripts.lock().unwrap().contains_key(sha)
    }

    pub fn flush_scripts(&self) {
        self.scripts.lock().unwrap().clear();
    }

    /// Answer every command with `message` as an error reply until cleared.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock().unwrap() = message.map(str::to_owned);
    }

    /// Execute a batch on a fresh connection.
    pub fn execute_batch(&self, commands: &[Command]) -> Vec<Value> {
        let mut session = Session::default();
        commands
            .iter()
            .map(|cmd| self.execute(&mut session, cmd))
            .collect()
    }

    pub fn execute(&self, session: &mut Session, cmd: &Command) -> Value {
        match (cmd.name(), session.queued.as_mut()) {
            ("MULTI", None) => {
                session.queued = Some(Vec::new());
                Value::Status("OK".into())
            }
            ("EXEC", Some(_)) => {
                let queued = session.queued.take().unwrap_or_default();
                Value::Array(queued.iter().map(|c| self.apply(c)).collect())
            }
            ("EXEC", None) => Value::Error("ERR EXEC without MULTI".into()),
            (_, Some(queued)) => {
                queued.push(cmd.clone());
                Value::Status("QUEUED".into())
            }
            (_, None) => self.apply(cmd),
        }
    }

    fn apply(&self, cmd: &Command) -> Value {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Value::Error(message);
        }
        let args: Vec<&[u8]> = cmd.args().iter().map(|a| a.as_ref()).collect();
        match (cmd.name(), args.as_slice()) {
            ("PING", []) => Value::Status("PONG".into()),
            ("AUTH", [..]) | ("SELECT", [_]) => Value::Status("OK".into()),
            ("CLIENT", [sub, _]) if sub.eq_ignore_ascii_case(b"SETNAME") => {
                Value::Status("OK".into())
            }
            ("GET", [key]) => match self.data.lock().unwrap().get(*key) {
                Some(v) => Value::Bulk(Bytes::from(v.clone())),
                None => Value::Nil,
            },
            ("SET", [key, value]) => {
                self.data.lock().unwrap().insert(key.to_vec(), value.to_vec());
                Value::Status("OK".into())
            }
            ("DEL", [key]) => {
                let removed = self.data.lock().unwrap().remove(*key).is_some()
                    | self.hashes.lock().unwrap().remove(*key).is_some();
                self.ttls.lock().unwrap().remove(*key);
                Value::Int(removed as i64)
            }
            ("HSET", [key, pairs @ ..]) if !pairs.is_empty() && pairs.len() % 2 == 0 => {
                let mut hashes = self.hashes.lock().unwrap();
                let hash = hashes.entry(key.to_vec()).or_default();
                let added = pairs
                    .chunks(2)
                    .filter(|pair| hash.insert(pair[0].to_vec(), pair[1].to_vec()).is_none())
                    .count();
                Value::Int(added as i64)
            }
            ("HSETNX", [key, field, value]) => {
                let mut hashes = self.hashes.lock().unwrap();
                let hash = hashes.entry(key.to_vec()).or_default();
                if hash.contains_key(*field) {
                    return Value::Int(0);
                }
                hash.insert(field.to_vec(), value.to_vec());
                Value::Int(1)
            }
            ("HGETALL", [key]) => Value::Array(
                self.hashes
                    .lock()
                    .unwrap()
                    .get(*key)
                    .into_iter()
                    .flatten()
                    .flat_map(|(f, v)| {
                        [Value::Bulk(Bytes::from(f.clone())), Value::Bulk(Bytes::from(v.clone()))]
                    })
                    .collect(),
            ),
            ("HMGET", [key, fields @ ..]) if !fields.is_empty() => {
                let hashes = self.hashes.lock().unwrap();
                let hash = hashes.get(*key);
                Value::Array(
                    fields
                        .iter()
                        .map(|f| match hash.and_then(|h| h.get(*f)) {
                            Some(v) => Value::Bulk(Bytes::from(v.clone())),
                            None => Value::Nil,
                        })
                        .collect(),
                )
            }
            ("HDEL", [key, fields @ ..]) if !fields.is_empty() => {
                let mut hashes = self.hashes.lock().unwrap();
                let Some(hash) = hashes.get_mut(*key) else {
                    return Value::Int(0);
                };
                let removed = fields.iter().filter(|f| hash.remove(**f).is_some()).count();
                if hash.is_empty() {
                    hashes.remove(*key);
                }
                Value::Int(removed as i64)
            }
            ("HINCRBY", [key, field, amount]) => {
                let Ok(amount) = String::from_utf8_lossy(amount).parse::<i64>() else {
                    return Value::Error("ERR value is not an integer or out of range".into());
                };
                let mut hashes = self.hashes.lock().unwrap();
                let hash = hashes.entry(key.to_vec()).or_default();
                let current = match hash.get(*field) {
                    Some(v) => match String::from_utf8_lossy(v).parse::<i64>() {
                        Ok(v) => v,
                        Err(_) => return Value::Error("ERR hash value is not an integer".into()),
                    },
                    None => 0,
                };
                let next = current + amount;
                hash.insert(field.to_vec(), next.to_string().into_bytes());
                Value::Int(next)
            }
            ("EXPIRE", [key, seconds]) => {
                let Ok(seconds) = String::from_utf8_lossy(seconds).parse::<i64>() else {
                    return Value::Error("ERR value is not an integer or out of range".into());
                };
                let exists = self.data.lock().unwrap().contains_key(*key)
                    || self.hashes.lock().unwrap().contains_key(*key);
                if exists {
                    self.ttls.lock().unwrap().insert(key.to_vec(), seconds);
                }
                Value::Int(exists as i64)
            }
            ("SCAN", [cursor, rest @ ..]) => self.scan(cursor, rest),
            ("SCRIPT", [sub, code]) if sub.eq_ignore_ascii_case(b"LOAD") => {
                let code = String::from_utf8_lossy(code).into_owned();
                let sha = digest(&code);
                self.scripts.lock().unwrap().insert(sha.clone(), code);
                Value::Bulk(Bytes::from(sha))
            }
            ("SCRIPT", [sub]) if sub.eq_ignore_ascii_case(b"FLUSH") => {
                self.flush_scripts();
                Value::Status("OK".into())
            }
            ("SCRIPT", [sub, shas @ ..]) if sub.eq_ignore_ascii_case(b"EXISTS") => Value::Array(
                shas.iter()
                    .map(|sha| Value::Int(self.has_script(&String::from_utf8_lossy(sha)) as i64))
                    .collect(),
            ),
            ("EVALSHA", [sha, ..]) => {
                let sha = String::from_utf8_lossy(sha).into_owned();
                if self.has_script(&sha) {
                    Value::Bulk(Bytes::from(format!("ran:{sha}")))
                } else {
                    Value::Error("NOSCRIPT No matching script. Please use EVAL.".into())
                }
            }
            ("EVAL", [code, ..]) => {
                let sha = digest(&String::from_utf8_lossy(code));
                Value::Bulk(Bytes::from(format!("ran:{sha}")))
            }
            (name, _) => Value::Error(format!("ERR unknown command '{name}'")),
        }
    }

    fn scan(&self, cursor: &[u8], options: &[&[u8]]) -> Value {
        let Some(cursor) = std::str::from_utf8(cursor)
            .ok()
            .and_then(|c| c.parse::<u64>().ok())
        else {
            return Value::Error("ERR invalid cursor".into());
        };
        let mut pattern: Option<&[u8]> = None;
        let mut count = DEFAULT_SCAN_COUNT;
        for pair in options.chunks(2) {
            match pair {
                [flag, value] if flag.eq_ignore_ascii_case(b"MATCH") => pattern = Some(*value),
                [flag, value] if flag.eq_ignore_ascii_case(b"COUNT") => {
                    count = String::from_utf8_lossy(value).parse().unwrap_or(DEFAULT_SCAN_COUNT)
                }
                _ => return Value::Error("ERR syntax error".into()),
            }
        }

        let keys: Vec<Vec<u8>> = self.data.lock().unwrap().keys().cloned().collect();
        let start = (cursor / self.cursor_scale) as usize;
        let end = (start + count).min(keys.len());
        let page = keys
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter(|k| pattern.map_or(true, |p| glob_match(p, k)))
            .map(|k| Value::Bulk(Bytes::from(k.clone())))
            .collect();
        let next = if end >= keys.len() {
            0
        } else {
            end as u64 * self.cursor_scale
        };
        Value::Array(vec![
            Value::Bulk(Bytes::from(next.to_string())),
            Value::Array(page),
        ])
    }
}

fn digest(code: &str) -> String {
    let mut hasher = DefaultHasher::new();
    code.hash(&mut hasher);
    format!("{:040x}", hasher.finish())
}

/// `*` and `?` glob matching, enough for SCAN MATCH.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.split_first(), text.split_first()) {
        (None, None) => true,
        (Some((b'*', rest)), _) => {
            glob_match(rest, text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some((b'?', rest)), Some((_, text_rest))) => glob_match(rest, text_rest),
        (Some((p, rest)), Some((t, text_rest))) if p == t => glob_match(rest, text_rest),
        _ => false,
    }
}

/// Several nodes addressed by `host:port` strings, standing in for the network.
#[derive(Default)]
pub struct MemoryCluster {
    nodes: Mutex<HashMap<String, Arc<MemoryNode>>>,
    calls: Mutex<Vec<(String, Vec<Command>)>>,
}

impl MemoryCluster {
    pub fn add_node(&self, addr: &str, node: MemoryNode) -> Arc<MemoryNode> {
        let node = Arc::new(node);
        self.nodes
            .lock()
            .unwrap()
            .insert(addr.to_string(), node.clone());
        node
    }

    pub fn node(&self, addr: &str) -> Arc<MemoryNode> {
        self.nodes.lock().unwrap()[addr].clone()
    }

    /// Every round trip so far as `(addr, commands)`.
    pub fn calls(&self) -> Vec<(String, Vec<Command>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl NodeTransport for MemoryCluster {
    async fn round_trip(
        &self,
        addr: &str,
        _params: &ConnectionParams,
        commands: &[Command],
    ) -> shardpipe::Result<Vec<Value>> {
        let node = self.nodes.lock().unwrap().get(addr).cloned();
        let Some(node) = node else {
            return Err(PipeError::Io {
                addr: addr.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        };
        self.calls
            .lock()
            .unwrap()
            .push((addr.to_string(), commands.to_vec()));
        Ok(node.execute_batch(commands))
    }
}

/// A cluster of primaries named `n0..`, addressed `10.0.0.<i>:6379`, with
/// keys `k<i>_<j>` on node `i`.
pub struct TestCluster {
    pub transport: Arc<MemoryCluster>,
    pub topology: Arc<StaticTopology>,
    pub client: ClientHandle,
}

pub fn node_addr(idx: usize) -> String {
    format!("10.0.0.{idx}:6379")
}

pub fn test_cluster(keys_per_node: &[usize]) -> TestCluster {
    let transport = Arc::new(MemoryCluster::default());
    let mut nodes = Vec::new();
    for (idx, &count) in keys_per_node.iter().enumerate() {
        let node = transport.add_node(&node_addr(idx), MemoryNode::default());
        for key in 0..count {
            node.insert(&format!("k{idx}_{key:03}"), "v");
        }
        nodes.push((format!("n{idx}"), node_addr(idx)));
    }
    let topology = Arc::new(StaticTopology::evenly_split(nodes));
    let client: ClientHandle = Arc::new(ClusterClient::new(
        ConnectionParams::new("10.0.0.0", 6379),
        topology.clone(),
        transport.clone(),
    ));
    TestCluster {
        transport,
        topology,
        client,
    }
}

pub fn primaries(cluster: &TestCluster) -> Vec<ClusterNode> {
    shardpipe::TopologySource::sorted_primaries(cluster.topology.as_ref())
}

/// Scan from `0` until the cursor returns to `0`; returns keys and the number
/// of calls it took.
pub async fn scan_to_end(
    client: &ClientHandle,
    options: &ScanOptions,
) -> shardpipe::Result<(Vec<String>, usize)> {
    let mut cursor = 0;
    let mut keys = Vec::new();
    let mut calls = 0;
    loop {
        let mut pipe = client.pipeline(Default::default());
        let idx = pipe.scan(cursor, options)?;
        let page = pipe.execute().await?.scan_page(idx)?;
        calls += 1;
        keys.extend(page.keys.iter().map(|k| String::from_utf8_lossy(k).into_owned()));
        cursor = page.cursor;
        if cursor == 0 {
            return Ok((keys, calls));
        }
        assert!(calls < 10_000, "scan did not terminate");
    }
}

/// Serve RESP on an ephemeral localhost port, backed by `node`.
pub async fn spawn_resp_server(node: Arc<MemoryNode>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let node = node.clone();
            tokio::spawn(async move {
                let _ = handle_conn(socket, node).await;
            });
        }
    });
    addr
}

async fn handle_conn(socket: TcpStream, node: Arc<MemoryNode>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    let mut session = Session::default();
    while let Some(frame) = framed.next().await {
        let reply = match parse_command(frame?) {
            Ok(cmd) => node.execute(&mut session, &cmd),
            Err(err) => Value::Error(format!("ERR {err}")),
        };
        framed.send(value_frame(reply)).await?;
    }
    Ok(())
}

fn parse_command(frame: BytesFrame) -> anyhow::Result<Command> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    let mut parts = parts.into_iter().map(|part| match part {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Ok(b),
        other => Err(anyhow::anyhow!("unexpected frame {other:?}")),
    });
    let name = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty command"))??;
    let mut cmd = Command::new(&String::from_utf8_lossy(&name));
    for part in parts {
        cmd = cmd.arg(part?);
    }
    Ok(cmd)
}

fn value_frame(value: Value) -> BytesFrame {
    match value {
        Value::Nil => BytesFrame::Null,
        Value::Int(v) => BytesFrame::Integer(v),
        Value::Bulk(b) => BytesFrame::BulkString(b),
        Value::Text(s) => BytesFrame::BulkString(Bytes::from(s)),
        Value::Status(s) => BytesFrame::SimpleString(Bytes::from(s)),
        Value::Array(items) => BytesFrame::Array(items.into_iter().map(value_frame).collect()),
        Value::Error(e) => BytesFrame::Error(e.into()),
    }
}
