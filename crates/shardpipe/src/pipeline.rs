//! The pipeline session surface shared by standalone and clustered clients.

use std::cell::Cell;

use async_trait::async_trait;
use bytes::Bytes;

use crate::command::{Command, Value};
use crate::config::ConnectionParams;
use crate::error::{PipeError, Result};
use crate::scripts::SmartScript;
use crate::stats::StatsScope;

/// Per-connection pipeline configuration, stored alongside each registry entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Wrap the batch in MULTI/EXEC (standalone connections only).
    pub transaction: bool,
}

/// A batch of commands executed as one round trip.
///
/// A pipeline is owned by the call site that created it and is consumed by
/// [`Pipeline::execute`]; it is never reused for a second batch.
#[async_trait]
pub trait Pipeline: Send {
    /// Parameters of the connection this pipeline talks to.
    fn connection_params(&self) -> &ConnectionParams;

    /// Queue a command; returns its index in the results.
    fn queue(&mut self, cmd: Command) -> usize;

    /// Queue a `SCAN` step. On clustered pipelines `cursor` is a virtual
    /// cursor spanning every primary.
    fn scan(&mut self, cursor: u64, options: &ScanOptions) -> Result<usize>;

    /// Number of queued commands.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count queued commands and consumed results in `stats`.
    fn attach_stats(&mut self, stats: StatsScope);

    /// Send the queued commands and collect one result per command, in order.
    async fn execute(self: Box<Self>) -> Result<PipelineResults>;

    /// Queue a script call, by digest or by source as the script decides.
    fn eval_smart(&mut self, script: &SmartScript, keys: &[&[u8]], args: &[&[u8]]) -> usize {
        self.queue(script.command(keys, args))
    }
}

/// Optional `SCAN` filters, passed to the store unmodified.
#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    pub pattern: Option<String>,
    pub count: Option<u64>,
    pub key_type: Option<String>,
}

impl ScanOptions {
    pub fn matching(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::default()
        }
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// `SCAN <cursor> [MATCH p] [COUNT n] [TYPE t]`.
    pub(crate) fn command(&self, cursor: u64) -> Command {
        let mut cmd = Command::new("SCAN").arg(cursor.to_string());
        if let Some(pattern) = &self.pattern {
            cmd = cmd.arg("MATCH").arg(pattern);
        }
        if let Some(count) = self.count {
            cmd = cmd.arg("COUNT").arg(count.to_string());
        }
        if let Some(key_type) = &self.key_type {
            cmd = cmd.arg("TYPE").arg(key_type);
        }
        cmd
    }
}

/// One `SCAN` reply: the cursor to continue from and the keys returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<Bytes>,
}

impl ScanPage {
    /// Parse the `[cursor, [key, ...]]` reply shape.
    pub fn from_value(value: &Value) -> Result<Self> {
        if let Value::Error(err) = value {
            return Err(PipeError::Server(err.clone()));
        }
        let parts = value
            .as_array()
            .filter(|parts| parts.len() == 2)
            .ok_or_else(|| PipeError::protocol("SCAN reply must be a two-element array"))?;
        let cursor = parts[0]
            .as_u64()
            .ok_or_else(|| PipeError::protocol("SCAN cursor is not an unsigned integer"))?;
        let keys = parts[1]
            .as_array()
            .ok_or_else(|| PipeError::protocol("SCAN keys must be an array"))?
            .iter()
            .map(|key| {
                key.as_bytes()
                    .map(Bytes::copy_from_slice)
                    .ok_or_else(|| PipeError::protocol("SCAN key is not a string"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { cursor, keys })
    }

    pub fn into_value(self) -> Value {
        Value::Array(vec![
            Value::Bulk(Bytes::from(self.cursor.to_string())),
            Value::Array(self.keys.into_iter().map(Value::Bulk).collect()),
        ])
    }
}

/// Ordered results of an executed pipeline.
#[derive(Debug)]
pub struct PipelineResults {
    values: Vec<Value>,
    accessed: Vec<Cell<bool>>,
    stats: StatsScope,
}

impl PipelineResults {
    pub(crate) fn new(values: Vec<Value>, stats: StatsScope) -> Self {
        let accessed = values.iter().map(|_| Cell::new(false)).collect();
        Self {
            values,
            accessed,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Result of the command queued at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        let value = self.values.get(index)?;
        if !self.accessed[index].replace(true) {
            self.stats.record_accessed();
        }
        Some(value)
    }

    /// Parse the result at `index` as a scan page.
    pub fn scan_page(&self, index: usize) -> Result<ScanPage> {
        let value = self
            .get(index)
            .ok_or_else(|| PipeError::protocol(format!("no result at index {index}")))?;
        ScanPage::from_value(value)
    }

    /// Fail with the first error reply, if any.
    pub fn raise_on_error(self) -> Result<Self> {
        if let Some(Value::Error(err)) = self.values.iter().find(|v| v.is_error()) {
            return Err(PipeError::Server(err.clone()));
        }
        Ok(self)
    }

    /// Take every value; all of them count as consumed.
    pub fn into_values(self) -> Vec<Value> {
        for flag in &self.accessed {
            if !flag.replace(true) {
                self.stats.record_accessed();
            }
        }
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_command_appends_filters_in_order() {
        let cmd = ScanOptions::matching("user:*").with_count(50).command(17);
        let args: Vec<&[u8]> = cmd.args().iter().map(|a| a.as_ref()).collect();
        assert_eq!(cmd.name(), "SCAN");
        assert_eq!(args, vec![&b"17"[..], b"MATCH", b"user:*", b"COUNT", b"50"]);
    }

    #[test]
    fn scan_page_parses_and_rebuilds() {
        let page = ScanPage {
            cursor: 42,
            keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
        };
        let parsed = ScanPage::from_value(&page.clone().into_value()).expect("parse");
        assert_eq!(parsed, page);

        assert!(ScanPage::from_value(&Value::Int(0)).is_err());
        assert!(matches!(
            ScanPage::from_value(&Value::Error("ERR x".into())),
            Err(PipeError::Server(_))
        ));
    }

    #[test]
    fn raise_on_error_surfaces_first_error() {
        let results = PipelineResults::new(
            vec![
                Value::Status("OK".into()),
                Value::Error("ERR one".into()),
                Value::Error("ERR two".into()),
            ],
            StatsScope::disabled(),
        );
        match results.raise_on_error() {
            Err(PipeError::Server(msg)) => assert_eq!(msg, "ERR one"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
