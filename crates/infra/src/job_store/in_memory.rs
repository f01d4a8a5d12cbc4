//! In-memory job store for tests/dev and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value as JsonValue;

use jobwarden_core::ExpectedVersion;

use super::query::ScanQuery;
use super::r#trait::{AppendOptions, Collection, Document, JobStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    body: JsonValue,
}

type Collections = HashMap<Collection, HashMap<String, Entry>>;

/// A single `RwLock` over all collections; every operation is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Collections>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: Collection) -> Result<usize, StoreError> {
        Ok(self.read()?.get(&collection).map_or(0, HashMap::len))
    }

    pub fn is_empty(&self, collection: Collection) -> Result<bool, StoreError> {
        Ok(self.len(collection)? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Collections>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collections>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn create_if_absent(&self, collection: Collection, key: &str, body: JsonValue) -> Result<bool, StoreError> {
        let mut all = self.write()?;
        let docs = all.entry(collection).or_default();
        if docs.contains_key(key) {
            return Ok(false);
        }
        docs.insert(key.to_string(), Entry { version: 1, body });
        Ok(true)
    }

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Document>, StoreError> {
        let all = self.read()?;
        Ok(all.get(&collection).and_then(|docs| docs.get(key)).map(|e| Document {
            key: key.to_string(),
            version: e.version,
            body: e.body.clone(),
        }))
    }

    fn upsert(&self, collection: Collection, key: &str, body: JsonValue) -> Result<u64, StoreError> {
        let mut all = self.write()?;
        let docs = all.entry(collection).or_default();
        let version = docs.get(key).map_or(1, |e| e.version + 1);
        docs.insert(key.to_string(), Entry { version, body });
        Ok(version)
    }

    fn replace(
        &self,
        collection: Collection,
        key: &str,
        expected: ExpectedVersion,
        body: JsonValue,
    ) -> Result<u64, StoreError> {
        let mut all = self.write()?;
        let entry = all
            .get_mut(&collection)
            .and_then(|docs| docs.get_mut(key))
            .ok_or_else(|| StoreError::conflict(collection, key))?;
        if !expected.matches(entry.version) {
            return Err(StoreError::conflict(collection, key));
        }
        entry.version += 1;
        entry.body = body;
        Ok(entry.version)
    }

    fn append_to_list(
        &self,
        collection: Collection,
        key: &str,
        field: &str,
        item: JsonValue,
        options: &AppendOptions,
    ) -> Result<bool, StoreError> {
        let mut all = self.write()?;
        let Some(entry) = all.get_mut(&collection).and_then(|docs| docs.get_mut(key)) else {
            return Ok(false);
        };
        let mut body = entry.body.clone();
        if !options.apply(&mut body, field, item)? {
            return Ok(false);
        }
        entry.body = body;
        entry.version += 1;
        Ok(true)
    }

    fn scan(&self, collection: Collection, query: &ScanQuery) -> Result<Vec<Document>, StoreError> {
        let all = self.read()?;
        let Some(docs) = all.get(&collection) else {
            return Ok(Vec::new());
        };
        let candidates = docs
            .iter()
            .filter(|(_, e)| query.matches(&e.body))
            .map(|(k, e)| Document {
                key: k.clone(),
                version: e.version,
                body: e.body.clone(),
            })
            .collect::<Vec<_>>();
        Ok(query.evaluate(candidates))
    }

    fn delete_batch(&self, collection: Collection, keys: &[String]) -> Result<usize, StoreError> {
        let mut all = self.write()?;
        let Some(docs) = all.get_mut(&collection) else {
            return Ok(0);
        };
        Ok(keys.iter().filter(|k| docs.remove(k.as_str()).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::Condition;
    use serde_json::json;

    #[test]
    fn create_if_absent_never_overwrites() {
        let store = InMemoryJobStore::new();
        assert!(store.create_if_absent(Collection::RunLocks, "ingest", json!({"n": 1})).unwrap());
        assert!(!store.create_if_absent(Collection::RunLocks, "ingest", json!({"n": 2})).unwrap());

        let doc = store.get(Collection::RunLocks, "ingest").unwrap().unwrap();
        assert_eq!(doc.body["n"], 1);
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn replace_checks_version() {
        let store = InMemoryJobStore::new();
        store.upsert(Collection::Jobs, "J1", json!({"a": 1})).unwrap();

        assert_eq!(
            store.replace(Collection::Jobs, "J1", ExpectedVersion::Exact(1), json!({"a": 2})).unwrap(),
            2
        );
        let err = store
            .replace(Collection::Jobs, "J1", ExpectedVersion::Exact(1), json!({"a": 3}))
            .unwrap_err();
        assert!(err.is_conflict());

        let missing = store.replace(Collection::Jobs, "nope", ExpectedVersion::Any, json!({}));
        assert!(missing.unwrap_err().is_conflict());
    }

    #[test]
    fn append_to_list_on_missing_document_is_false() {
        let store = InMemoryJobStore::new();
        let appended = store
            .append_to_list(Collection::Jobs, "J1", "messages", json!("x"), &AppendOptions::new())
            .unwrap();
        assert!(!appended);
    }

    #[test]
    fn collections_are_isolated() {
        let store = InMemoryJobStore::new();
        store.upsert(Collection::Jobs, "k", json!({})).unwrap();
        assert!(store.get(Collection::JobMeta, "k").unwrap().is_none());
        assert_eq!(store.len(Collection::Jobs).unwrap(), 1);

        let n = store
            .delete_batch(Collection::Jobs, &["k".to_string(), "other".to_string()])
            .unwrap();
        assert_eq!(n, 1);
        assert!(store.is_empty(Collection::Jobs).unwrap());
    }

    #[test]
    fn poisoned_lock_is_reported_as_unavailable() {
        let store = InMemoryJobStore::new();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = store.inner.write().unwrap();
            panic!("writer died holding the lock");
        }));

        assert!(matches!(store.len(Collection::Jobs), Err(StoreError::Unavailable(_))));
        assert!(store.is_empty(Collection::Jobs).is_err());
        assert!(store.get(Collection::Jobs, "k").is_err());
    }

    #[test]
    fn scan_filters() {
        let store = InMemoryJobStore::new();
        store.upsert(Collection::Jobs, "a", json!({"job_type": "x"})).unwrap();
        store.upsert(Collection::Jobs, "b", json!({"job_type": "y"})).unwrap();

        let found = store
            .scan(Collection::Jobs, &ScanQuery::all().filter(Condition::eq("job_type", "y")))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "b");
    }
}
