//! A store whose every operation fails, for exercising error paths.

use serde_json::Value as JsonValue;

use jobwarden_core::ExpectedVersion;

use super::query::ScanQuery;
use super::r#trait::{AppendOptions, Collection, Document, JobStore, StoreError};

#[derive(Debug, Default)]
pub struct UnavailableJobStore;

impl UnavailableJobStore {
    fn down<T>() -> Result<T, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

impl JobStore for UnavailableJobStore {
    fn create_if_absent(&self, _: Collection, _: &str, _: JsonValue) -> Result<bool, StoreError> {
        Self::down()
    }

    fn get(&self, _: Collection, _: &str) -> Result<Option<Document>, StoreError> {
        Self::down()
    }

    fn upsert(&self, _: Collection, _: &str, _: JsonValue) -> Result<u64, StoreError> {
        Self::down()
    }

    fn replace(&self, _: Collection, _: &str, _: ExpectedVersion, _: JsonValue) -> Result<u64, StoreError> {
        Self::down()
    }

    fn append_to_list(
        &self,
        _: Collection,
        _: &str,
        _: &str,
        _: JsonValue,
        _: &AppendOptions,
    ) -> Result<bool, StoreError> {
        Self::down()
    }

    fn scan(&self, _: Collection, _: &ScanQuery) -> Result<Vec<Document>, StoreError> {
        Self::down()
    }

    fn delete_batch(&self, _: Collection, _: &[String]) -> Result<usize, StoreError> {
        Self::down()
    }
}
