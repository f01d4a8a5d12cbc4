//! Redis-backed job store (feature `redis`).
//!
//! Each document is a hash at `{namespace}:{collection}:{key}` with two fields,
//! `version` and `body` (JSON text). Creation and conditional replacement run
//! as Lua scripts so they are atomic on the server. Scans walk the collection
//! with `SCAN` and filter in process.

use std::time::Duration;

use redis::{Connection, Script};
use serde_json::Value as JsonValue;
use tracing::debug;

use jobwarden_core::ExpectedVersion;

use super::query::ScanQuery;
use super::r#trait::{AppendOptions, Collection, Document, JobStore, StoreError};

const CREATE_IF_ABSENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'version', 1, 'body', ARGV[1])
return 1
"#;

// ARGV[2] is the expected version, or "" for any.
const REPLACE: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
  return -1
end
if ARGV[2] ~= '' and current ~= ARGV[2] then
  return -1
end
local next = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HSET', KEYS[1], 'body', ARGV[1])
return next
"#;

const UPSERT: &str = r#"
local next = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HSET', KEYS[1], 'body', ARGV[1])
return next
"#;

const SCAN_BATCH: usize = 200;
const APPEND_ATTEMPTS: usize = 8;

#[derive(Debug)]
pub struct RedisJobStore {
    client: redis::Client,
    namespace: String,
    timeout: Duration,
    create_script: Script,
    replace_script: Script,
    upsert_script: Script,
}

impl RedisJobStore {
    pub fn new(redis_url: impl AsRef<str>, namespace: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            timeout,
            create_script: Script::new(CREATE_IF_ABSENT),
            replace_script: Script::new(REPLACE),
            upsert_script: Script::new(UPSERT),
        })
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        let conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(map_redis_error)?;
        conn.set_read_timeout(Some(self.timeout)).map_err(map_redis_error)?;
        conn.set_write_timeout(Some(self.timeout)).map_err(map_redis_error)?;
        Ok(conn)
    }

    fn read_document(conn: &mut Connection, redis_key: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let (version, body): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(redis_key)
            .arg("version")
            .arg("body")
            .query(conn)
            .map_err(map_redis_error)?;
        match (version, body) {
            (Some(version), Some(body)) => Ok(Some(Document {
                key: key.to_string(),
                version,
                body: serde_json::from_str(&body)?,
            })),
            _ => Ok(None),
        }
    }

    fn replace_with(
        &self,
        conn: &mut Connection,
        collection: Collection,
        key: &str,
        expected: ExpectedVersion,
        body: &JsonValue,
    ) -> Result<u64, StoreError> {
        let expected_arg = match expected {
            ExpectedVersion::Any => String::new(),
            ExpectedVersion::Exact(v) => v.to_string(),
        };
        let next: i64 = self
            .replace_script
            .key(document_key(&self.namespace, collection, key))
            .arg(serde_json::to_string(body)?)
            .arg(expected_arg)
            .invoke(conn)
            .map_err(map_redis_error)?;
        if next < 0 {
            return Err(StoreError::conflict(collection, key));
        }
        Ok(next as u64)
    }
}

/// `{namespace}:{collection}:{key}`
pub fn document_key(namespace: &str, collection: Collection, key: &str) -> String {
    format!("{namespace}:{}:{key}", collection.as_str())
}

/// `SCAN MATCH` pattern covering one collection.
pub fn collection_pattern(namespace: &str, collection: Collection) -> String {
    format!("{namespace}:{}:*", collection.as_str())
}

fn map_redis_error(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(format!("redis: {err}"))
}

impl JobStore for RedisJobStore {
    fn create_if_absent(&self, collection: Collection, key: &str, body: JsonValue) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let created: i64 = self
            .create_script
            .key(document_key(&self.namespace, collection, key))
            .arg(serde_json::to_string(&body)?)
            .invoke(&mut conn)
            .map_err(map_redis_error)?;
        Ok(created == 1)
    }

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Document>, StoreError> {
        let mut conn = self.connection()?;
        Self::read_document(&mut conn, &document_key(&self.namespace, collection, key), key)
    }

    fn upsert(&self, collection: Collection, key: &str, body: JsonValue) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        let version: u64 = self
            .upsert_script
            .key(document_key(&self.namespace, collection, key))
            .arg(serde_json::to_string(&body)?)
            .invoke(&mut conn)
            .map_err(map_redis_error)?;
        Ok(version)
    }

    fn replace(
        &self,
        collection: Collection,
        key: &str,
        expected: ExpectedVersion,
        body: JsonValue,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        self.replace_with(&mut conn, collection, key, expected, &body)
    }

    // Read, apply in process, write back conditionally on the version read.
    fn append_to_list(
        &self,
        collection: Collection,
        key: &str,
        field: &str,
        item: JsonValue,
        options: &AppendOptions,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let redis_key = document_key(&self.namespace, collection, key);

        for attempt in 1..=APPEND_ATTEMPTS {
            let Some(doc) = Self::read_document(&mut conn, &redis_key, key)? else {
                return Ok(false);
            };
            let mut body = doc.body;
            if !options.apply(&mut body, field, item.clone())? {
                return Ok(false);
            }
            match self.replace_with(&mut conn, collection, key, ExpectedVersion::Exact(doc.version), &body) {
                Ok(_) => return Ok(true),
                Err(err) if err.is_conflict() => {
                    debug!(collection = %collection, key, attempt, "append lost a race, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::conflict(collection, key))
    }

    fn scan(&self, collection: Collection, query: &ScanQuery) -> Result<Vec<Document>, StoreError> {
        let mut conn = self.connection()?;
        let pattern = collection_pattern(&self.namespace, collection);
        let prefix_len = pattern.len() - 1;

        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query(&mut conn)
                .map_err(map_redis_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();

        let mut documents = Vec::with_capacity(keys.len());
        for redis_key in keys {
            let key = &redis_key[prefix_len..];
            if let Some(doc) = Self::read_document(&mut conn, &redis_key, key)? {
                documents.push(doc);
            }
        }
        Ok(query.evaluate(documents))
    }

    fn delete_batch(&self, collection: Collection, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let redis_keys: Vec<String> = keys
            .iter()
            .map(|k| document_key(&self.namespace, collection, k))
            .collect();
        let removed: usize = redis::cmd("DEL")
            .arg(&redis_keys)
            .query(&mut conn)
            .map_err(map_redis_error)?;
        Ok(removed)
    }
}
