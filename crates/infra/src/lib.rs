//! Infrastructure layer: document stores, repositories, run locks, job
//! lifecycle, cleanup, status and configuration.

pub mod config;
pub mod job_store;
pub mod jobs;
pub mod repository;
pub mod system;

pub use config::{JobsConfig, StoreBackend, build_store};
pub use system::{JobSystem, JobSystemBuilder};

#[cfg(test)]
mod integration_tests;
