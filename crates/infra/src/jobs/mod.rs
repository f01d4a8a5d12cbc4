//! Job tracking: run locks, lifecycle, execution, cleanup and status.
//!
//! ## Components
//!
//! - `RunLockManager`: cluster-wide locks per job type, acquired in a fixed order
//! - `JobService`: starts jobs and applies every state transition
//! - `PersistenceJobEventListener`: turns bus events into service calls
//! - `JobTrigger` / `JobRunner`: start a job type and drive its body on a thread
//! - `cleanup`: retention, dead-job sweep, orphaned lock recovery
//! - `status`: health verdicts from recent executions

pub mod cleanup;
pub mod definition;
pub mod error;
pub mod listeners;
pub mod lock;
pub mod mutex;
pub mod runner;
pub mod service;
pub mod status;
pub mod trigger;

pub use cleanup::{
    CleanupStrategy, ClearDeadLocks, DeleteSkippedJobs, HousekeepingWorker, KeepLastJobs, RetentionScope,
    StopDeadJobs, WorkerHandle,
};
pub use definition::{JobDefinition, JobFailure, JobRunnable};
pub use error::JobsError;
pub use listeners::PersistenceJobEventListener;
pub use lock::{RunLockManager, lock_order};
pub use mutex::MutexGroups;
pub use runner::JobRunner;
pub use service::{JobService, StartOutcome, TransitionOutcome};
pub use status::{JobStatusIndicator, Status, StatusCalculator, StatusDetail};
pub use trigger::JobTrigger;
