//! Named connection registry.
//!
//! Binds symbolic names to pipeline factories so call sites can ask for
//! "the `users` pipeline" without repeating connection details. The unnamed
//! (`None`) entry is the default connection.
//!
//! Registration is a bootstrap/teardown activity. Once a name is bound, its
//! connection target can only change after an explicit [`ConnectionRegistry::disconnect`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::client::{ClientHandle, ClientKind};
use crate::config::ConnectionParams;
use crate::error::{display_name, PipeError, Result};
use crate::pipeline::{Pipeline, PipelineOptions};

/// Produces fresh pipelines for one registry entry.
#[derive(Clone)]
pub struct PipelineFactory {
    client: ClientHandle,
    options: PipelineOptions,
}

impl PipelineFactory {
    pub fn new(client: ClientHandle, options: PipelineOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    pub fn build(&self) -> Box<dyn Pipeline> {
        self.client.pipeline(self.options)
    }
}

struct ConnectionEntry {
    factory: PipelineFactory,
    client: Option<ClientHandle>,
    /// Target of the factory's pipelines, captured when the entry was bound.
    params: ConnectionParams,
}

/// Caller-owned table of named connections; share it with `Arc`.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<Option<String>, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `factory` (and optionally the client behind it) to `name`.
    ///
    /// Rebinding a name is allowed only when the new factory targets the same
    /// connection parameters as the current one; otherwise this fails with
    /// [`PipeError::AlreadyConnected`] and the existing entry is kept.
    pub fn connect(
        &self,
        name: Option<&str>,
        factory: PipelineFactory,
        client: Option<ClientHandle>,
    ) -> Result<()> {
        let key = name.map(str::to_owned);
        // Factory code runs before the lock is taken.
        let params = factory.build().connection_params().clone();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&key) {
            if existing.params != params {
                tracing::warn!(
                    name = display_name(name),
                    current = ?existing.params,
                    requested = ?params,
                    "refusing to rebind connection to a different target"
                );
                return Err(PipeError::AlreadyConnected { name: key });
            }
        }

        tracing::info!(
            name = display_name(name),
            addr = %params.addr(),
            transaction = factory.options.transaction,
            "connection registered"
        );
        entries.insert(
            key,
            ConnectionEntry {
                factory,
                client,
                params,
            },
        );
        Ok(())
    }

    /// Register `client` under `name`, handing out pipelines built with `options`.
    ///
    /// Fails with [`PipeError::InvalidPipeline`], registering nothing, when
    /// the client decodes replies to text (scan cursors and keys must stay raw
    /// bytes) or when a transaction is requested on a clustered client.
    pub fn connect_client(
        &self,
        client: ClientHandle,
        name: Option<&str>,
        options: PipelineOptions,
    ) -> Result<()> {
        if client.connection_params().decode_responses {
            return Err(PipeError::invalid(name, "decode_responses set to true"));
        }
        if options.transaction && client.kind() == ClientKind::Cluster {
            return Err(PipeError::invalid(
                name,
                "MULTI/EXEC transactions are not supported on clustered connections",
            ));
        }
        let factory = PipelineFactory::new(client.clone(), options);
        self.connect(name, factory, Some(client))
    }

    /// A new pipeline for `name`.
    pub fn get(&self, name: Option<&str>) -> Result<Box<dyn Pipeline>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&name.map(str::to_owned))
            .map(|entry| entry.factory.build())
            .ok_or_else(|| PipeError::invalid(name, "is not configured"))
    }

    /// The low-level client registered with `name`, if one was supplied.
    pub fn get_client(&self, name: Option<&str>) -> Result<Option<ClientHandle>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&name.map(str::to_owned))
            .map(|entry| entry.client.clone())
            .ok_or_else(|| PipeError::invalid(name, "is not configured"))
    }

    pub fn is_connected(&self, name: Option<&str>) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name.map(str::to_owned))
    }

    /// Registered names, default connection first, then alphabetical.
    pub fn names(&self) -> Vec<Option<String>> {
        let mut names: Vec<Option<String>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Remove `name`; a no-op when it is not registered.
    pub fn disconnect(&self, name: Option<&str>) {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.map(str::to_owned));
        if removed.is_some() {
            tracing::info!(name = display_name(name), "connection removed");
        }
    }

    /// Remove every connection.
    pub fn reset(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!("connection registry reset");
    }
}
