//! Clustered client and pipeline.
//!
//! Commands are routed per hash slot and sent to every involved primary
//! concurrently, one round trip per primary. `SCAN` is the exception: the
//! pipeline turns the cluster's independent per-primary cursor spaces into a
//! single virtual cursor (see [`crate::cursor`]), scanning exactly one
//! primary per call instead of fanning out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;

use crate::client::{ClientKind, StoreClient};
use crate::command::{Command, Value};
use crate::config::ConnectionParams;
use crate::cursor::ScanPosition;
use crate::error::{PipeError, Result};
use crate::pipeline::{Pipeline, PipelineOptions, PipelineResults, ScanOptions, ScanPage};
use crate::stats::StatsScope;
use crate::topology::{key_slot, node_for_slot, ClusterNode, TopologySource};
use crate::transport::{NodeTransport, TcpTransport};

/// Client for a sharded deployment.
pub struct ClusterClient {
    params: ConnectionParams,
    topology: Arc<dyn TopologySource>,
    transport: Arc<dyn NodeTransport>,
}

impl ClusterClient {
    /// `params` describe the seed node and carry the auth settings used
    /// against every primary.
    pub fn new(
        params: ConnectionParams,
        topology: Arc<dyn TopologySource>,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        Self {
            params,
            topology,
            transport,
        }
    }

    pub fn with_tcp(params: ConnectionParams, topology: Arc<dyn TopologySource>) -> Self {
        Self::new(params, topology, Arc::new(TcpTransport::default()))
    }

    /// Current primaries, ordered by name.
    pub fn sorted_primaries(&self) -> Vec<ClusterNode> {
        self.topology.sorted_primaries()
    }
}

impl StoreClient for ClusterClient {
    fn kind(&self) -> ClientKind {
        ClientKind::Cluster
    }

    fn connection_params(&self) -> &ConnectionParams {
        &self.params
    }

    fn pipeline(&self, options: PipelineOptions) -> Box<dyn Pipeline> {
        Box::new(ClusterPipeline {
            params: self.params.clone(),
            topology: self.topology.clone(),
            transport: self.transport.clone(),
            options,
            queued: Vec::new(),
            stats: StatsScope::disabled(),
        })
    }
}

/// Where a queued command goes.
#[derive(Clone, Debug)]
enum Route {
    /// Primary owning the routing key's slot.
    Keyed,
    /// Any primary; the first in the snapshot.
    Any,
    /// Every primary; any error reply wins over success replies.
    AllPrimaries,
    /// One scan step pinned to a primary; its reply cursor is rewritten.
    Scan { addr: String, position: ScanPosition },
}

#[derive(Debug)]
struct Queued {
    cmd: Command,
    route: Route,
}

/// Pipeline over a cluster with `SCAN` cursor virtualization.
pub struct ClusterPipeline {
    params: ConnectionParams,
    topology: Arc<dyn TopologySource>,
    transport: Arc<dyn NodeTransport>,
    options: PipelineOptions,
    queued: Vec<Queued>,
    stats: StatsScope,
}

impl ClusterPipeline {
    fn push(&mut self, cmd: Command, route: Route) -> usize {
        self.stats.record_created();
        self.queued.push(Queued { cmd, route });
        self.queued.len() - 1
    }

    /// Rewrite one primary's `[native_cursor, keys]` reply into the virtual
    /// cursor space. The topology is read again here; it may differ from the
    /// snapshot the scan was queued against.
    fn intercept_scan(&self, reply: Value, position: ScanPosition) -> Result<Value> {
        if reply.is_error() {
            return Ok(reply);
        }
        let page = ScanPage::from_value(&reply)?;
        let shards = self.topology.sorted_primaries().len();
        let cursor = position.advance(page.cursor, shards)?;
        tracing::trace!(
            shard_index = position.shard_index,
            native_cursor = page.cursor,
            virtual_cursor = cursor,
            keys = page.keys.len(),
            "scan step intercepted"
        );
        Ok(ScanPage {
            cursor,
            keys: page.keys,
        }
        .into_value())
    }
}

fn route_for(cmd: &Command) -> Route {
    if cmd.name() == "SCRIPT" {
        if let Some("LOAD" | "FLUSH" | "EXISTS") = cmd.subcommand().as_deref() {
            return Route::AllPrimaries;
        }
    }
    if cmd.routing_key().is_some() {
        Route::Keyed
    } else {
        Route::Any
    }
}

/// Commands bound for one primary, with their positions in the pipeline.
#[derive(Default)]
struct NodeBatch {
    positions: Vec<usize>,
    commands: Vec<Command>,
}

#[async_trait]
impl Pipeline for ClusterPipeline {
    fn connection_params(&self) -> &ConnectionParams {
        &self.params
    }

    fn queue(&mut self, cmd: Command) -> usize {
        let route = route_for(&cmd);
        self.push(cmd, route)
    }

    fn scan(&mut self, cursor: u64, options: &ScanOptions) -> Result<usize> {
        let position = ScanPosition::from_cursor(cursor);
        let primaries = self.topology.sorted_primaries();
        let node = primaries
            .get(position.shard_index)
            .ok_or(PipeError::ShardIndexOutOfRange {
                shard_index: position.shard_index,
                shards: primaries.len(),
            })?;
        let cmd = options.command(position.native_cursor);
        let route = Route::Scan {
            addr: node.addr.clone(),
            position,
        };
        Ok(self.push(cmd, route))
    }

    fn len(&self) -> usize {
        self.queued.len()
    }

    fn attach_stats(&mut self, stats: StatsScope) {
        for _ in &self.queued {
            stats.record_created();
        }
        self.stats = stats;
    }

    async fn execute(self: Box<Self>) -> Result<PipelineResults> {
        if self.queued.is_empty() {
            return Ok(PipelineResults::new(Vec::new(), self.stats.clone()));
        }
        if self.options.transaction {
            return Err(PipeError::invalid(
                None,
                "MULTI/EXEC transactions are not supported on clustered connections",
            ));
        }

        let primaries = self.topology.sorted_primaries();
        let first = primaries.first().ok_or(PipeError::EmptyTopology)?;

        let mut batches: HashMap<String, NodeBatch> = HashMap::new();
        let mut add = |addr: &str, pos: usize, cmd: &Command| {
            let batch = batches.entry(addr.to_string()).or_default();
            batch.positions.push(pos);
            batch.commands.push(cmd.clone());
        };
        for (pos, queued) in self.queued.iter().enumerate() {
            match &queued.route {
                Route::Keyed => {
                    let key = queued.cmd.routing_key().unwrap_or_default();
                    let slot = key_slot(key);
                    let node = node_for_slot(&primaries, slot)
                        .ok_or(PipeError::SlotUnowned { slot })?;
                    add(&node.addr, pos, &queued.cmd);
                }
                Route::Any => add(&first.addr, pos, &queued.cmd),
                Route::AllPrimaries => {
                    for node in &primaries {
                        add(&node.addr, pos, &queued.cmd);
                    }
                }
                Route::Scan { addr, .. } => add(addr, pos, &queued.cmd),
            }
        }

        tracing::trace!(
            commands = self.queued.len(),
            primaries = batches.len(),
            "executing cluster pipeline"
        );
        let params = &self.params;
        let transport = &self.transport;
        let replies = try_join_all(batches.into_iter().map(|(addr, batch)| async move {
            let values = transport.round_trip(&addr, params, &batch.commands).await?;
            if values.len() != batch.commands.len() {
                return Err(PipeError::protocol(format!(
                    "{addr}: expected {} replies, got {}",
                    batch.commands.len(),
                    values.len()
                )));
            }
            Ok::<_, PipeError>((batch.positions, values))
        }))
        .await?;

        // Fan-out commands collect one reply per primary; an error beats a success.
        let mut slots: Vec<Option<Value>> = vec![None; self.queued.len()];
        for (positions, values) in replies {
            for (pos, value) in positions.into_iter().zip(values) {
                let keep_existing = match &slots[pos] {
                    Some(existing) => existing.is_error() || !value.is_error(),
                    None => false,
                };
                if !keep_existing {
                    slots[pos] = Some(value);
                }
            }
        }

        let mut values = Vec::with_capacity(slots.len());
        for (queued, slot) in self.queued.iter().zip(slots) {
            let value =
                slot.ok_or_else(|| PipeError::protocol("missing reply for queued command"))?;
            let value = match queued.route {
                Route::Scan { position, .. } => self.intercept_scan(value, position)?,
                _ => value,
            };
            values.push(value);
        }
        Ok(PipelineResults::new(values, self.stats.clone()))
    }
}
