//! `jobwarden-core`: job tracking domain.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod clock;
pub mod error;
pub mod id;
pub mod meta;
pub mod record;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use meta::{DisabledJob, JobMeta, RunLock, RunningJob};
pub use record::{JobMessage, JobRecord, JobStatus, Level};
pub use version::ExpectedVersion;
