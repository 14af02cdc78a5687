//! Hash-backed records.
//!
//! A [`HashStruct`] is a local copy of one store hash. Every operation comes
//! in two forms: a `queue_*` method that adds commands to a caller-supplied
//! pipeline and returns [`PendingChanges`], and an async method that runs
//! the commands on its own pipeline from the registry. The local copy only
//! changes once the pending changes are applied to executed results, so a
//! record never reflects writes the store has not acknowledged.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::command::{Command, Value};
use crate::error::{PipeError, Result};
use crate::pipeline::{Pipeline, PipelineResults};
use crate::registry::ConnectionRegistry;

/// Field that carries the record key in caller data; never stored in the hash.
pub const DEFAULT_KEY_NAME: &str = "_key";

/// Where records of one kind live and how they are written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructSchema {
    keyspace: String,
    key_name: String,
    required: BTreeSet<String>,
    ttl: Option<Duration>,
    connection: Option<String>,
}

impl StructSchema {
    pub fn new(keyspace: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            key_name: DEFAULT_KEY_NAME.to_string(),
            required: BTreeSet::new(),
            ttl: None,
            connection: None,
        }
    }

    pub fn with_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = key_name.into();
        self
    }

    /// Fields that must be given on create and can never be removed.
    pub fn with_required<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Refresh the hash's expiry after every write. Sub-second values round
    /// up to one second.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Registry connection used by the self-executing operations.
    pub fn on_connection(mut self, name: impl Into<String>) -> Self {
        self.connection = Some(name.into());
        self
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    /// Store key of record `key`. The key is wrapped in a hash tag so a
    /// record's commands always land on one slot.
    pub fn redis_key(&self, key: &str) -> String {
        format!("{}{{{}}}", self.keyspace, key)
    }

    /// Queue a `DEL` per record; returns the result indices.
    pub fn queue_delete(&self, pipe: &mut dyn Pipeline, keys: &[&str]) -> Vec<usize> {
        keys.iter()
            .map(|key| pipe.queue(Command::del(self.redis_key(key))))
            .collect()
    }

    /// Delete records without loading them; returns how many existed.
    pub async fn delete(&self, registry: &ConnectionRegistry, keys: &[&str]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut pipe = registry.get(self.connection())?;
        let indices = self.queue_delete(pipe.as_mut(), keys);
        let results = pipe.execute().await?.raise_on_error()?;
        Ok(indices
            .into_iter()
            .filter_map(|idx| results.get(idx).and_then(Value::as_u64))
            .sum())
    }

    fn ttl_secs(&self) -> Option<u64> {
        self.ttl.map(|ttl| {
            let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
            secs.max(1)
        })
    }
}

/// Commands a record queued on a pipeline, to be applied to the record
/// once that pipeline has executed.
#[must_use = "apply the pending changes to the executed results"]
#[derive(Debug, Default)]
pub struct PendingChanges {
    steps: Vec<Step>,
}

impl PendingChanges {
    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn push(&mut self, index: usize, action: Action) {
        self.steps.push(Step { index, action });
    }

    fn append(&mut self, mut other: PendingChanges) {
        self.steps.append(&mut other.steps);
    }
}

#[derive(Debug)]
struct Step {
    index: usize,
    action: Action,
}

#[derive(Debug)]
enum Action {
    LoadFields(Vec<String>),
    LoadAll,
    Set(Vec<(String, Bytes)>),
    SetIfAbsent(String, Bytes),
    Remove(Vec<String>),
    Incr(String),
    Clear,
    Expire,
}

/// Local copy of one hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashStruct {
    schema: Arc<StructSchema>,
    key: String,
    data: BTreeMap<String, Bytes>,
}

impl HashStruct {
    /// An empty record; nothing is read or written.
    pub fn new(schema: Arc<StructSchema>, key: impl Into<String>) -> Self {
        Self::from_data(schema, key, BTreeMap::new())
    }

    /// A record rebuilt from data already in hand, without touching the store.
    pub fn from_data(
        schema: Arc<StructSchema>,
        key: impl Into<String>,
        mut data: BTreeMap<String, Bytes>,
    ) -> Self {
        data.remove(schema.key_name());
        Self {
            schema,
            key: key.into(),
            data,
        }
    }

    /// Write `fields` and read the whole hash back in one round trip.
    ///
    /// With `nx`, fields already present in the store keep their stored value.
    pub async fn create(
        schema: Arc<StructSchema>,
        registry: &ConnectionRegistry,
        key: impl Into<String>,
        fields: &[(&str, &[u8])],
        nx: bool,
    ) -> Result<Self> {
        let mut record = Self::new(schema, key);
        let missing: Vec<&str> = record
            .schema
            .required
            .iter()
            .map(String::as_str)
            .filter(|required| !fields.iter().any(|(field, _)| field == required))
            .collect();
        if !missing.is_empty() {
            return Err(record.invalid(format!("missing required field(s): {missing:?}")));
        }

        let changes: Vec<(&str, Option<&[u8]>)> = fields
            .iter()
            .map(|(field, value)| (*field, Some(*value)))
            .collect();
        record
            .run(registry, |record, pipe| {
                let mut pending = record.queue_update(pipe, &changes, nx)?;
                pending.append(record.queue_load(pipe, None));
                Ok(pending)
            })
            .await?;
        Ok(record)
    }

    /// Read a record; `fields` as in [`HashStruct::queue_load`].
    pub async fn fetch(
        schema: Arc<StructSchema>,
        registry: &ConnectionRegistry,
        key: impl Into<String>,
        fields: Option<&[&str]>,
    ) -> Result<Self> {
        let mut record = Self::new(schema, key);
        record.load(registry, fields).await?;
        Ok(record)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn redis_key(&self) -> String {
        self.schema.redis_key(&self.key)
    }

    pub fn schema(&self) -> &StructSchema {
        &self.schema
    }

    pub fn get(&self, field: &str) -> Option<&Bytes> {
        self.data.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get_str(field).and_then(|v| v.parse().ok())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.data.contains_key(field)
    }

    /// Fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.data.iter().map(|(field, value)| (field.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the local copy holds any data.
    pub fn persisted(&self) -> bool {
        !self.data.is_empty()
    }

    /// Queue a read. `None` loads every field with `HGETALL` and replaces
    /// the local copy; a field list uses `HMGET` and drops listed fields the
    /// store does not have.
    pub fn queue_load(&self, pipe: &mut dyn Pipeline, fields: Option<&[&str]>) -> PendingChanges {
        let mut pending = PendingChanges::default();
        match fields {
            None => {
                let idx = pipe.queue(Command::new("HGETALL").key(self.redis_key()));
                pending.push(idx, Action::LoadAll);
            }
            Some([]) => {}
            Some(fields) => {
                let cmd = fields
                    .iter()
                    .fold(Command::new("HMGET").key(self.redis_key()), |cmd, field| {
                        cmd.arg(field)
                    });
                let fields = fields.iter().map(|f| f.to_string()).collect();
                pending.push(pipe.queue(cmd), Action::LoadFields(fields));
            }
        }
        pending
    }

    /// Queue writes. Fields mapped to `None` are removed with `HDEL`; the
    /// rest are written with one `HSET`, or one `HSETNX` each when `nx` is
    /// set.
    pub fn queue_update(
        &self,
        pipe: &mut dyn Pipeline,
        changes: &[(&str, Option<&[u8]>)],
        nx: bool,
    ) -> Result<PendingChanges> {
        if changes.iter().any(|(field, _)| *field == self.schema.key_name()) {
            return Err(self.invalid("cannot update the record key"));
        }
        let deletes: Vec<&str> = changes
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(field, _)| *field)
            .collect();
        self.check_removable(&deletes)?;

        let mut pending = PendingChanges::default();
        let updates = changes
            .iter()
            .filter_map(|(field, value)| value.map(|v| (field.to_string(), Bytes::copy_from_slice(v))));
        if nx {
            for (field, value) in updates {
                let cmd = Command::new("HSETNX")
                    .key(self.redis_key())
                    .arg(&field)
                    .arg(&value);
                pending.push(pipe.queue(cmd), Action::SetIfAbsent(field, value));
            }
        } else {
            let updates: Vec<(String, Bytes)> = updates.collect();
            if !updates.is_empty() {
                let cmd = updates
                    .iter()
                    .fold(Command::new("HSET").key(self.redis_key()), |cmd, (f, v)| {
                        cmd.arg(f).arg(v)
                    });
                pending.push(pipe.queue(cmd), Action::Set(updates));
            }
        }
        if !deletes.is_empty() {
            pending.append(self.queue_hdel(pipe, &deletes));
        }
        self.queue_expire(pipe, &mut pending);
        Ok(pending)
    }

    /// Queue `HDEL` of `fields`. Required fields and the key field can't be
    /// removed.
    pub fn queue_remove(&self, pipe: &mut dyn Pipeline, fields: &[&str]) -> Result<PendingChanges> {
        self.check_removable(fields)?;
        let mut pending = PendingChanges::default();
        if fields.is_empty() {
            return Ok(pending);
        }
        pending.append(self.queue_hdel(pipe, fields));
        self.queue_expire(pipe, &mut pending);
        Ok(pending)
    }

    /// Queue `HINCRBY`; the new value lands in the local copy.
    pub fn queue_incr(&self, pipe: &mut dyn Pipeline, field: &str, amount: i64) -> PendingChanges {
        let mut pending = PendingChanges::default();
        let cmd = Command::new("HINCRBY")
            .key(self.redis_key())
            .arg(field)
            .arg(amount.to_string());
        pending.push(pipe.queue(cmd), Action::Incr(field.to_string()));
        self.queue_expire(pipe, &mut pending);
        pending
    }

    /// Queue `DEL` of the whole hash.
    pub fn queue_clear(&self, pipe: &mut dyn Pipeline) -> PendingChanges {
        let mut pending = PendingChanges::default();
        pending.push(pipe.queue(Command::del(self.redis_key())), Action::Clear);
        pending
    }

    /// Fold executed results into the local copy. The first error reply
    /// among the pending commands is returned; steps before it stay applied.
    pub fn apply(&mut self, pending: PendingChanges, results: &PipelineResults) -> Result<()> {
        for Step { index, action } in pending.steps {
            let value = results
                .get(index)
                .ok_or_else(|| PipeError::protocol(format!("no result at index {index}")))?;
            if let Value::Error(err) = value {
                return Err(PipeError::Server(err.clone()));
            }
            match action {
                Action::LoadFields(fields) => {
                    let values = value
                        .as_array()
                        .filter(|values| values.len() == fields.len())
                        .ok_or_else(|| unexpected("HMGET", value))?;
                    for (field, value) in fields.into_iter().zip(values) {
                        match value.as_bytes() {
                            Some(_) if field == self.schema.key_name() => {}
                            Some(bytes) => {
                                self.data.insert(field, Bytes::copy_from_slice(bytes));
                            }
                            None => {
                                self.data.remove(&field);
                            }
                        }
                    }
                }
                Action::LoadAll => {
                    let items = value
                        .as_array()
                        .filter(|items| items.len() % 2 == 0)
                        .ok_or_else(|| unexpected("HGETALL", value))?;
                    let mut data = BTreeMap::new();
                    for pair in items.chunks(2) {
                        let (Some(field), Some(value)) = (pair[0].as_bytes(), pair[1].as_bytes())
                        else {
                            return Err(unexpected("HGETALL", value));
                        };
                        let field = String::from_utf8_lossy(field).into_owned();
                        if field != self.schema.key_name() {
                            data.insert(field, Bytes::copy_from_slice(value));
                        }
                    }
                    self.data = data;
                }
                Action::Set(fields) => self.data.extend(fields),
                Action::SetIfAbsent(field, new_value) => {
                    if *value == Value::Int(1) {
                        self.data.insert(field, new_value);
                    }
                }
                Action::Remove(fields) => {
                    for field in fields {
                        self.data.remove(&field);
                    }
                }
                Action::Incr(field) => {
                    let Value::Int(amount) = value else {
                        return Err(unexpected("HINCRBY", value));
                    };
                    self.data.insert(field, Bytes::from(amount.to_string()));
                }
                Action::Clear => self.data.clear(),
                Action::Expire => {}
            }
        }
        Ok(())
    }

    /// Re-read the record from the store.
    pub async fn load(&mut self, registry: &ConnectionRegistry, fields: Option<&[&str]>) -> Result<()> {
        self.run(registry, |record, pipe| Ok(record.queue_load(pipe, fields)))
            .await
    }

    pub async fn update(
        &mut self,
        registry: &ConnectionRegistry,
        changes: &[(&str, Option<&[u8]>)],
        nx: bool,
    ) -> Result<()> {
        self.run(registry, |record, pipe| record.queue_update(pipe, changes, nx))
            .await
    }

    pub async fn remove(&mut self, registry: &ConnectionRegistry, fields: &[&str]) -> Result<()> {
        self.run(registry, |record, pipe| record.queue_remove(pipe, fields))
            .await
    }

    /// Increment `field` by `amount`; returns the new value.
    pub async fn incr(&mut self, registry: &ConnectionRegistry, field: &str, amount: i64) -> Result<i64> {
        self.run(registry, |record, pipe| Ok(record.queue_incr(pipe, field, amount)))
            .await?;
        self.get_i64(field)
            .ok_or_else(|| PipeError::protocol(format!("{field} is not an integer after HINCRBY")))
    }

    /// Delete the hash and empty the local copy.
    pub async fn clear(&mut self, registry: &ConnectionRegistry) -> Result<()> {
        self.run(registry, |record, pipe| Ok(record.queue_clear(pipe)))
            .await
    }

    async fn run<F>(&mut self, registry: &ConnectionRegistry, queue: F) -> Result<()>
    where
        F: FnOnce(&Self, &mut dyn Pipeline) -> Result<PendingChanges>,
    {
        let mut pipe = registry.get(self.schema.connection())?;
        let pending = queue(self, pipe.as_mut())?;
        if pending.is_empty() {
            return Ok(());
        }
        tracing::trace!(key = %self.redis_key(), commands = pending.len(), "executing record pipeline");
        let results = pipe.execute().await?;
        self.apply(pending, &results)
    }

    fn queue_hdel(&self, pipe: &mut dyn Pipeline, fields: &[&str]) -> PendingChanges {
        let mut pending = PendingChanges::default();
        let cmd = fields
            .iter()
            .fold(Command::new("HDEL").key(self.redis_key()), |cmd, field| {
                cmd.arg(field)
            });
        let fields = fields.iter().map(|f| f.to_string()).collect();
        pending.push(pipe.queue(cmd), Action::Remove(fields));
        pending
    }

    fn queue_expire(&self, pipe: &mut dyn Pipeline, pending: &mut PendingChanges) {
        let Some(secs) = self.schema.ttl_secs() else {
            return;
        };
        if pending.is_empty() {
            return;
        }
        let cmd = Command::new("EXPIRE")
            .key(self.redis_key())
            .arg(secs.to_string());
        pending.push(pipe.queue(cmd), Action::Expire);
    }

    fn check_removable(&self, fields: &[&str]) -> Result<()> {
        if fields.iter().any(|field| *field == self.schema.key_name()) {
            return Err(self.invalid("cannot remove the record key"));
        }
        let required: Vec<&str> = fields
            .iter()
            .copied()
            .filter(|field| self.schema.required.contains(*field))
            .collect();
        if !required.is_empty() {
            return Err(self.invalid(format!("cannot remove required field(s): {required:?}")));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> PipeError {
        PipeError::InvalidRecord {
            key: self.key.clone(),
            reason: reason.into(),
        }
    }
}

fn unexpected(command: &str, value: &Value) -> PipeError {
    PipeError::protocol(format!("unexpected {command} reply {value:?}"))
}
