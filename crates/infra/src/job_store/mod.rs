//! Document store boundary for job records, job metadata and run locks.
//!
//! The store knows nothing about jobs: it persists versioned JSON documents
//! in three collections and offers the atomic primitives the lock manager
//! and lifecycle service build on (create-if-absent, conditional replace,
//! guarded list append).

pub mod in_memory;
pub mod query;
pub mod r#trait;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(test)]
pub(crate) mod unavailable;

pub use in_memory::InMemoryJobStore;
pub use query::{Condition, ScanQuery};
pub use r#trait::{AppendOptions, Collection, Document, JobStore, StoreError};

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresJobStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisJobStore;
#[cfg(test)]
pub(crate) use unavailable::UnavailableJobStore;
