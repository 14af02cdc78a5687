//! Command-line client for shardpipe connections.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use shardpipe::{
    register_smart_script, ClientHandle, ClusterClient, Command, ConnectionParams,
    ConnectionRegistry, PipelineOptions, ScanOptions, StandaloneClient, StaticTopology,
    StatsConfig, StatsScope, TopologySource,
};

#[derive(Parser, Debug)]
#[command(name = "shardpipe")]
#[command(about = "Pipelines and cluster-wide SCAN for Redis-protocol stores", long_about = None)]
struct Args {
    /// Deadline for each round trip.
    #[arg(long, default_value = "5s")]
    op_timeout: humantime::Duration,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Scan every primary of a cluster with one virtual cursor.
    Scan {
        /// Primaries as `name=host:port`, comma separated.
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
        /// Password sent to every primary.
        #[arg(long, env = "SHARDPIPE_PASSWORD")]
        password: Option<String>,
        /// Glob passed to SCAN MATCH.
        #[arg(long)]
        pattern: Option<String>,
        /// COUNT hint passed to each SCAN step.
        #[arg(long)]
        count: Option<u64>,
        /// Print a JSON report instead of one key per line.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Load a Lua script and print its digest.
    ScriptLoad {
        #[arg(long, default_value = "redis://127.0.0.1:6379")]
        url: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Send PING to a standalone node.
    Ping {
        #[arg(long, default_value = "redis://127.0.0.1:6379")]
        url: String,
    },
}

/// Output of `scan --json`.
#[derive(Serialize, Debug)]
struct ScanReport {
    primaries: usize,
    steps: usize,
    keys: Vec<String>,
}

const SCAN_CONNECTION: &str = "scan";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,shardpipe=info".into()),
        )
        .init();

    let args = Args::parse();
    let op_timeout: Duration = args.op_timeout.into();
    let registry = ConnectionRegistry::new();

    match args.command {
        CliCommand::Scan {
            nodes,
            password,
            pattern,
            count,
            json,
        } => {
            let options = ScanOptions {
                pattern,
                count,
                key_type: None,
            };
            let report = run_scan(&registry, &nodes, password, &options, op_timeout).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for key in &report.keys {
                    println!("{key}");
                }
            }
        }
        CliCommand::ScriptLoad { url, file } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("read script {}", file.display()))?;
            connect_url(&registry, &url)?;
            let script = tokio::time::timeout(
                op_timeout,
                register_smart_script(&registry, None, &code, None),
            )
            .await
            .context("SCRIPT LOAD timed out")??;
            println!("{}", script.sha());
        }
        CliCommand::Ping { url } => {
            connect_url(&registry, &url)?;
            let mut pipe = registry.get(None)?;
            pipe.queue(Command::new("PING"));
            let results = tokio::time::timeout(op_timeout, pipe.execute())
                .await
                .context("PING timed out")??
                .raise_on_error()?;
            let reply = results
                .get(0)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            println!("{reply}");
        }
    }
    Ok(())
}

fn connect_url(registry: &ConnectionRegistry, url: &str) -> anyhow::Result<()> {
    let client: ClientHandle = Arc::new(StandaloneClient::from_url(url)?);
    registry.connect_client(client, None, PipelineOptions::default())?;
    Ok(())
}

/// Parse `name=host:port` pairs into a topology with evenly split slots.
fn parse_nodes(nodes: &[String]) -> anyhow::Result<StaticTopology> {
    let pairs = nodes
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(name, addr)| !name.is_empty() && addr.contains(':'))
                .with_context(|| format!("expected name=host:port, got {pair:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(StaticTopology::evenly_split(pairs))
}

async fn run_scan(
    registry: &ConnectionRegistry,
    nodes: &[String],
    password: Option<String>,
    options: &ScanOptions,
    op_timeout: Duration,
) -> anyhow::Result<ScanReport> {
    let topology = Arc::new(parse_nodes(nodes)?);
    let seed = topology
        .sorted_primaries()
        .first()
        .map(|node| node.addr.clone())
        .context("no primaries given")?;
    let (host, port) = seed
        .rsplit_once(':')
        .context("primary address must be host:port")?;
    let mut params = ConnectionParams::new(host, port.parse().context("invalid port")?);
    params.password = password;

    let client: ClientHandle = Arc::new(ClusterClient::with_tcp(params, topology.clone()));
    registry.connect_client(client, Some(SCAN_CONNECTION), PipelineOptions::default())?;

    let stats = StatsScope::new(StatsConfig::from_env());
    stats
        .measure("scan", async {
            let mut report = ScanReport {
                primaries: topology.sorted_primaries().len(),
                steps: 0,
                keys: Vec::new(),
            };
            let mut cursor = 0;
            loop {
                let mut pipe = registry.get(Some(SCAN_CONNECTION))?;
                pipe.attach_stats(stats.clone());
                let idx = pipe.scan(cursor, options)?;
                let results = tokio::time::timeout(op_timeout, pipe.execute())
                    .await
                    .context("SCAN timed out")??;
                let page = results.scan_page(idx)?;
                report.steps += 1;
                report.keys.extend(
                    page.keys
                        .iter()
                        .map(|key| String::from_utf8_lossy(key).into_owned()),
                );
                tracing::debug!(cursor = page.cursor, keys = page.keys.len(), "scan step");
                cursor = page.cursor;
                if cursor == 0 {
                    break;
                }
            }
            Ok::<_, anyhow::Error>(report)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_list() {
        let topology =
            parse_nodes(&["b=10.0.0.2:6379".to_string(), "a=10.0.0.1:6379".to_string()])
                .expect("parse");
        let names: Vec<String> = topology
            .sorted_primaries()
            .into_iter()
            .map(|node| node.name)
            .collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn rejects_malformed_nodes() {
        assert!(parse_nodes(&["just-a-host".to_string()]).is_err());
        assert!(parse_nodes(&["=127.0.0.1:1".to_string()]).is_err());
    }

    #[test]
    fn cli_parses_scan_flags() {
        let args = Args::parse_from([
            "shardpipe",
            "--op-timeout",
            "250ms",
            "scan",
            "--nodes",
            "a=h:1,b=h:2",
            "--count",
            "50",
            "--json",
        ]);
        let op_timeout: Duration = args.op_timeout.into();
        assert_eq!(op_timeout, Duration::from_millis(250));
        match args.command {
            CliCommand::Scan {
                nodes, count, json, ..
            } => {
                assert_eq!(nodes, ["a=h:1", "b=h:2"]);
                assert_eq!(count, Some(50));
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
