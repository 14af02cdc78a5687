//! Named pipelines and cross-shard `SCAN` for Redis-protocol stores.
//!
//! Applications register connections once at startup in a
//! [`ConnectionRegistry`] and ask for pipelines by name afterwards. Pipelines
//! from a clustered client make `SCAN` iterate the whole cluster with one
//! opaque cursor:
//!
//! ```no_run
//! # async fn demo(registry: &shardpipe::ConnectionRegistry) -> shardpipe::Result<()> {
//! use shardpipe::ScanOptions;
//!
//! let mut cursor = 0;
//! loop {
//!     let mut pipe = registry.get(Some("cache"))?;
//!     let idx = pipe.scan(cursor, &ScanOptions::matching("session:*"))?;
//!     let page = pipe.execute().await?.scan_page(idx)?;
//!     for key in &page.keys {
//!         println!("{}", String::from_utf8_lossy(key));
//!     }
//!     cursor = page.cursor;
//!     if cursor == 0 {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod cursor;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod resp;
pub mod scripts;
pub mod stats;
pub mod structs;
pub mod topology;
pub mod transport;

pub use client::{ClientHandle, ClientKind, StandaloneClient, StoreClient};
pub use cluster::ClusterClient;
pub use command::{Command, Value};
pub use config::{ConnectionParams, StatsConfig, TransportConfig};
pub use cursor::ScanPosition;
pub use error::{PipeError, Result};
pub use pipeline::{Pipeline, PipelineOptions, PipelineResults, ScanOptions, ScanPage};
pub use registry::{ConnectionRegistry, PipelineFactory};
pub use scripts::{register_smart_script, SmartScript, UseDigest};
pub use stats::{StatsScope, StatsSnapshot};
pub use structs::{HashStruct, PendingChanges, StructSchema};
pub use topology::{ClusterNode, SlotRange, StaticTopology, TopologySource};
pub use transport::{NodeTransport, TcpTransport};
