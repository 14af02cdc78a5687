//! Store client capability and the standalone (single-node) implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{Command, Value};
use crate::config::ConnectionParams;
use crate::error::{PipeError, Result};
use crate::pipeline::{Pipeline, PipelineOptions, PipelineResults, ScanOptions};
use crate::stats::StatsScope;
use crate::transport::{NodeTransport, TcpTransport};

/// Which deployment shape a client talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientKind {
    Standalone,
    Cluster,
}

/// A low-level store client: reports its target and hands out fresh pipelines.
pub trait StoreClient: Send + Sync {
    fn kind(&self) -> ClientKind;

    /// Network and auth parameters; equal parameters mean the same target.
    fn connection_params(&self) -> &ConnectionParams;

    /// A new, empty pipeline.
    fn pipeline(&self, options: PipelineOptions) -> Box<dyn Pipeline>;
}

/// Shared handle to a store client.
pub type ClientHandle = Arc<dyn StoreClient>;

/// Client for a single, unsharded node.
pub struct StandaloneClient {
    params: ConnectionParams,
    transport: Arc<dyn NodeTransport>,
}

impl StandaloneClient {
    pub fn new(params: ConnectionParams, transport: Arc<dyn NodeTransport>) -> Self {
        Self { params, transport }
    }

    /// A client over pooled TCP for `url`. No connection is opened until the
    /// first pipeline executes.
    pub fn from_url(url: &str) -> Result<Self> {
        let params = ConnectionParams::from_url(url)?;
        Ok(Self::new(params, Arc::new(TcpTransport::default())))
    }
}

impl StoreClient for StandaloneClient {
    fn kind(&self) -> ClientKind {
        ClientKind::Standalone
    }

    fn connection_params(&self) -> &ConnectionParams {
        &self.params
    }

    fn pipeline(&self, options: PipelineOptions) -> Box<dyn Pipeline> {
        Box::new(StandalonePipeline {
            params: self.params.clone(),
            transport: self.transport.clone(),
            options,
            commands: Vec::new(),
            stats: StatsScope::disabled(),
        })
    }
}

/// Pipeline against one node, optionally wrapped in MULTI/EXEC.
pub struct StandalonePipeline {
    params: ConnectionParams,
    transport: Arc<dyn NodeTransport>,
    options: PipelineOptions,
    commands: Vec<Command>,
    stats: StatsScope,
}

#[async_trait]
impl Pipeline for StandalonePipeline {
    fn connection_params(&self) -> &ConnectionParams {
        &self.params
    }

    fn queue(&mut self, cmd: Command) -> usize {
        self.stats.record_created();
        self.commands.push(cmd);
        self.commands.len() - 1
    }

    fn scan(&mut self, cursor: u64, options: &ScanOptions) -> Result<usize> {
        Ok(self.queue(options.command(cursor)))
    }

    fn len(&self) -> usize {
        self.commands.len()
    }

    fn attach_stats(&mut self, stats: StatsScope) {
        for _ in &self.commands {
            stats.record_created();
        }
        self.stats = stats;
    }

    async fn execute(self: Box<Self>) -> Result<PipelineResults> {
        let this = *self;
        if this.commands.is_empty() {
            return Ok(PipelineResults::new(Vec::new(), this.stats));
        }
        let addr = this.params.addr();
        tracing::trace!(
            node = %addr,
            commands = this.commands.len(),
            transaction = this.options.transaction,
            "executing pipeline"
        );

        let expected = this.commands.len();
        let values = if this.options.transaction {
            let mut batch = Vec::with_capacity(expected + 2);
            batch.push(Command::new("MULTI"));
            batch.extend(this.commands);
            batch.push(Command::new("EXEC"));
            let replies = this
                .transport
                .round_trip(&addr, &this.params, &batch)
                .await?;
            check_reply_count(&addr, batch.len(), replies.len())?;
            unwrap_exec(replies)?
        } else {
            this.transport
                .round_trip(&addr, &this.params, &this.commands)
                .await?
        };
        check_reply_count(&addr, expected, values.len())?;
        Ok(PipelineResults::new(values, this.stats))
    }
}

fn check_reply_count(addr: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(PipeError::protocol(format!(
            "{addr}: expected {expected} replies, got {got}"
        )));
    }
    Ok(())
}

/// Results of a MULTI/EXEC batch live in the final EXEC reply.
fn unwrap_exec(mut replies: Vec<Value>) -> Result<Vec<Value>> {
    match replies.pop() {
        Some(Value::Array(values)) => Ok(values),
        Some(Value::Nil) => Err(PipeError::Server(
            "transaction aborted: watched key changed".to_string(),
        )),
        Some(Value::Error(err)) => Err(PipeError::Server(err)),
        Some(other) => Err(PipeError::protocol(format!(
            "unexpected EXEC reply {other:?}"
        ))),
        None => Err(PipeError::protocol("missing EXEC reply")),
    }
}
