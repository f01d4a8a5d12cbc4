//! Typed repositories over the document store.
//!
//! Records, metadata and locks are stored as serde JSON. Every mutation of
//! an existing document is read → pure transition → conditional replace,
//! retried a bounded number of times when another writer got in first.

pub mod jobs;
pub mod locks;
pub mod meta;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;

use jobwarden_core::{DomainError, DomainResult, ExpectedVersion};

use crate::job_store::{Collection, Document, JobStore, StoreError};

pub use jobs::JobRepository;
pub use locks::RunLockRepository;
pub use meta::JobMetaRepository;

/// Attempts of a read-modify-write before giving up with `Conflict`.
pub const UPDATE_ATTEMPTS: usize = 5;

/// Result of a conditional update.
#[derive(Debug)]
pub enum UpdateOutcome<R> {
    Updated(R),
    NotFound,
    /// The transition refused to run; nothing was written.
    Rejected(DomainError),
}

pub(crate) fn decode<T: DeserializeOwned>(collection: Collection, doc: &Document) -> Result<T, StoreError> {
    serde_json::from_value(doc.body.clone())
        .map_err(|e| StoreError::Codec(format!("{collection}/{}: {e}", doc.key)))
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<JsonValue, StoreError> {
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn update_with<T, R, F>(
    store: &dyn JobStore,
    collection: Collection,
    key: &str,
    mut transition: F,
) -> Result<UpdateOutcome<R>, StoreError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut T) -> DomainResult<R>,
{
    for attempt in 1..=UPDATE_ATTEMPTS {
        let Some(doc) = store.get(collection, key)? else {
            return Ok(UpdateOutcome::NotFound);
        };
        let mut value: T = decode(collection, &doc)?;
        let result = match transition(&mut value) {
            Ok(result) => result,
            Err(err) => return Ok(UpdateOutcome::Rejected(err)),
        };
        match store.replace(collection, key, ExpectedVersion::Exact(doc.version), encode(&value)?) {
            Ok(_) => return Ok(UpdateOutcome::Updated(result)),
            Err(err) if err.is_conflict() => {
                debug!(collection = %collection, key, attempt, "concurrent update, retrying");
            }
            Err(err) => return Err(err),
        }
    }
    Err(StoreError::conflict(collection, key))
}
