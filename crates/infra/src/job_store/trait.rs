use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use jobwarden_core::ExpectedVersion;

use super::query::{Condition, ScanQuery};

/// The three document collections the job tracker persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Jobs,
    JobMeta,
    RunLocks,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Jobs, Collection::JobMeta, Collection::RunLocks];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Jobs => "jobs",
            Collection::JobMeta => "job_meta",
            Collection::RunLocks => "run_locks",
        }
    }
}

impl core::fmt::Display for Collection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored JSON document together with its write version.
///
/// Versions start at 1 on creation and grow by one on every write.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub key: String,
    pub version: u64,
    pub body: JsonValue,
}

/// Job store operation error.
///
/// `Unavailable` is transient infrastructure failure and is propagated.
/// `Conflict` is the expected outcome of a lost optimistic-concurrency race.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflicting write on {collection}/{key}")]
    Conflict { collection: Collection, key: String },

    #[error("codec error: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub(crate) fn conflict(collection: Collection, key: &str) -> Self {
        StoreError::Conflict {
            collection,
            key: key.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Codec(value.to_string())
    }
}

/// Side effects of [`JobStore::append_to_list`] besides the append itself.
///
/// The guard is evaluated against the document before the write; if any
/// condition fails nothing is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendOptions {
    pub guard: Vec<Condition>,
    pub set: Map<String, JsonValue>,
    /// Timestamp fields only ever moved forward.
    pub advance: Vec<(&'static str, chrono::DateTime<chrono::Utc>)>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only_if(mut self, condition: Condition) -> Self {
        self.guard.push(condition);
        self
    }

    pub fn set(mut self, field: &str, value: JsonValue) -> Self {
        self.set.insert(field.to_string(), value);
        self
    }

    pub fn advance(mut self, field: &'static str, to: chrono::DateTime<chrono::Utc>) -> Self {
        self.advance.push((field, to));
        self
    }

    /// Applies the append to `body` in place. Returns `false` (leaving `body`
    /// untouched) when the guard rejects the document.
    pub fn apply(&self, body: &mut JsonValue, field: &str, item: JsonValue) -> Result<bool, StoreError> {
        if !self.guard.iter().all(|c| c.matches(body)) {
            return Ok(false);
        }
        let object = body
            .as_object_mut()
            .ok_or_else(|| StoreError::Codec("document body is not an object".to_string()))?;

        match object.entry(field.to_string()).or_insert_with(|| JsonValue::Array(Vec::new())) {
            JsonValue::Array(items) => items.push(item),
            other => {
                return Err(StoreError::Codec(format!(
                    "field `{field}` is not a list: {other}"
                )));
            }
        }
        for (k, v) in &self.set {
            object.insert(k.clone(), v.clone());
        }
        for (k, to) in &self.advance {
            let current = object.get(*k).and_then(super::query::timestamp_of);
            if current.is_none_or(|c| c < *to) {
                object.insert((*k).to_string(), serde_json::to_value(to)?);
            }
        }
        Ok(true)
    }
}

/// Storage capability required by the job tracker.
///
/// Implementations: [`InMemoryJobStore`](super::InMemoryJobStore) always,
/// `RedisJobStore` and `PostgresJobStore` behind their cargo features.
pub trait JobStore: Send + Sync + core::fmt::Debug {
    /// Atomically creates the document. Returns `false` without modification
    /// if the key already exists.
    fn create_if_absent(&self, collection: Collection, key: &str, body: JsonValue) -> Result<bool, StoreError>;

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Document>, StoreError>;

    /// Unconditional write. Returns the new version.
    fn upsert(&self, collection: Collection, key: &str, body: JsonValue) -> Result<u64, StoreError>;

    /// Conditional write of an existing document.
    ///
    /// Fails with [`StoreError::Conflict`] if the document is missing or its
    /// version does not satisfy `expected`.
    fn replace(
        &self,
        collection: Collection,
        key: &str,
        expected: ExpectedVersion,
        body: JsonValue,
    ) -> Result<u64, StoreError>;

    /// Atomically appends `item` to the list at `field`, applying `options`
    /// in the same write. Returns `false` if the document does not exist or
    /// the guard rejected it.
    fn append_to_list(
        &self,
        collection: Collection,
        key: &str,
        field: &str,
        item: JsonValue,
        options: &AppendOptions,
    ) -> Result<bool, StoreError>;

    fn scan(&self, collection: Collection, query: &ScanQuery) -> Result<Vec<Document>, StoreError>;

    /// Deletes the given keys; missing keys are ignored. Returns how many
    /// documents were actually removed.
    fn delete_batch(&self, collection: Collection, keys: &[String]) -> Result<usize, StoreError>;

    fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        Ok(self.delete_batch(collection, &[key.to_string()])? > 0)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create_if_absent(&self, collection: Collection, key: &str, body: JsonValue) -> Result<bool, StoreError> {
        (**self).create_if_absent(collection, key, body)
    }

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Document>, StoreError> {
        (**self).get(collection, key)
    }

    fn upsert(&self, collection: Collection, key: &str, body: JsonValue) -> Result<u64, StoreError> {
        (**self).upsert(collection, key, body)
    }

    fn replace(
        &self,
        collection: Collection,
        key: &str,
        expected: ExpectedVersion,
        body: JsonValue,
    ) -> Result<u64, StoreError> {
        (**self).replace(collection, key, expected, body)
    }

    fn append_to_list(
        &self,
        collection: Collection,
        key: &str,
        field: &str,
        item: JsonValue,
        options: &AppendOptions,
    ) -> Result<bool, StoreError> {
        (**self).append_to_list(collection, key, field, item, options)
    }

    fn scan(&self, collection: Collection, query: &ScanQuery) -> Result<Vec<Document>, StoreError> {
        (**self).scan(collection, query)
    }

    fn delete_batch(&self, collection: Collection, keys: &[String]) -> Result<usize, StoreError> {
        (**self).delete_batch(collection, keys)
    }
}
