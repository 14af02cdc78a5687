//! Result-consumption counters scoped to one logical operation.
//!
//! A scope counts how many pipeline results were produced and how many of
//! them the caller actually read. Scopes are passed explicitly to the
//! pipelines they observe; a disabled scope records nothing.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::StatsConfig;

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    accessed: AtomicU64,
}

/// Shared handle to one operation's counters. Clones observe the same counts.
#[derive(Clone, Debug, Default)]
pub struct StatsScope {
    counters: Option<Arc<Counters>>,
}

/// Point-in-time copy of a scope's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub results_created: u64,
    pub results_accessed: u64,
}

impl StatsSnapshot {
    /// Fraction of produced results that were read, `0.0` when none were produced.
    pub fn consumption(&self) -> f64 {
        if self.results_created == 0 {
            0.0
        } else {
            self.results_accessed as f64 / self.results_created as f64
        }
    }
}

impl StatsScope {
    pub fn new(config: StatsConfig) -> Self {
        if config.enabled {
            Self::enabled()
        } else {
            Self::disabled()
        }
    }

    pub fn enabled() -> Self {
        Self {
            counters: Some(Arc::new(Counters::default())),
        }
    }

    pub fn disabled() -> Self {
        Self { counters: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.counters.is_some()
    }

    pub(crate) fn record_created(&self) {
        if let Some(c) = &self.counters {
            c.created.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_accessed(&self) {
        if let Some(c) = &self.counters {
            c.accessed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        match &self.counters {
            Some(c) => StatsSnapshot {
                results_created: c.created.load(Ordering::Relaxed),
                results_accessed: c.accessed.load(Ordering::Relaxed),
            },
            None => StatsSnapshot::default(),
        }
    }

    pub fn reset(&self) {
        if let Some(c) = &self.counters {
            c.created.store(0, Ordering::Relaxed);
            c.accessed.store(0, Ordering::Relaxed);
        }
    }

    /// Reset, run `op`, then log what it produced and consumed.
    pub async fn measure<F>(&self, name: &str, op: F) -> F::Output
    where
        F: Future,
    {
        if !self.is_enabled() {
            return op.await;
        }
        self.reset();
        let out = op.await;
        let snap = self.snapshot();
        tracing::info!(
            target: "shardpipe::stats",
            pid = std::process::id(),
            name,
            results_accessed = snap.results_accessed,
            results_created = snap.results_created,
            consumption = %format!("{:.0}%", snap.consumption() * 100.0),
            "pipeline stats"
        );
        out
    }
}
