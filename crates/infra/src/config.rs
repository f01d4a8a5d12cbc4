//! Configuration loading and store selection.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::job_store::{InMemoryJobStore, JobStore};
use crate::jobs::JobsError;

/// Which [`JobStore`] implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    #[default]
    InMemory,
    Redis,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in-memory" | "memory" => Ok(StoreBackend::InMemory),
            "redis" => Ok(StoreBackend::Redis),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(JobsError::InvalidConfig(format!("unknown store backend: {other}"))),
        }
    }
}

impl core::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            StoreBackend::InMemory => "in-memory",
            StoreBackend::Redis => "redis",
            StoreBackend::Postgres => "postgres",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub store: StoreBackend,
    pub redis_url: String,
    pub redis_namespace: String,
    pub database_url: Option<String>,
    pub store_timeout_ms: u64,
    pub keep_last_jobs: usize,
    pub keep_skipped_jobs: usize,
    pub mark_dead_after_secs: u64,
    pub cleanup_interval_secs: u64,
    pub keep_alive_secs: u64,
    pub delivery_timeout_ms: u64,
    pub hostname: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::InMemory,
            redis_url: "redis://localhost:6379".to_string(),
            redis_namespace: "jobwarden".to_string(),
            database_url: None,
            store_timeout_ms: 2_000,
            keep_last_jobs: 100,
            keep_skipped_jobs: 10,
            mark_dead_after_secs: 30,
            cleanup_interval_secs: 600,
            keep_alive_secs: 20,
            delivery_timeout_ms: 1_000,
            hostname: "localhost".to_string(),
        }
    }
}

impl JobsConfig {
    /// Reads `JOBWARDEN_*` (and `DATABASE_URL`, `HOSTNAME`) from the process
    /// environment. Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            store: parse_or(&var, "JOBWARDEN_STORE", defaults.store),
            redis_url: var("JOBWARDEN_REDIS_URL").unwrap_or_else(|| {
                debug!("JOBWARDEN_REDIS_URL not set; using {}", defaults.redis_url);
                defaults.redis_url.clone()
            }),
            redis_namespace: var("JOBWARDEN_REDIS_NAMESPACE").unwrap_or(defaults.redis_namespace),
            database_url: var("DATABASE_URL"),
            store_timeout_ms: parse_or(&var, "JOBWARDEN_STORE_TIMEOUT_MS", defaults.store_timeout_ms),
            keep_last_jobs: parse_or(&var, "JOBWARDEN_KEEP_LAST_JOBS", defaults.keep_last_jobs),
            keep_skipped_jobs: parse_or(&var, "JOBWARDEN_KEEP_SKIPPED_JOBS", defaults.keep_skipped_jobs),
            mark_dead_after_secs: parse_or(&var, "JOBWARDEN_MARK_DEAD_AFTER_SECS", defaults.mark_dead_after_secs),
            cleanup_interval_secs: parse_or(&var, "JOBWARDEN_CLEANUP_INTERVAL_SECS", defaults.cleanup_interval_secs),
            keep_alive_secs: parse_or(&var, "JOBWARDEN_KEEP_ALIVE_SECS", defaults.keep_alive_secs),
            delivery_timeout_ms: parse_or(&var, "JOBWARDEN_DELIVERY_TIMEOUT_MS", defaults.delivery_timeout_ms),
            hostname: var("JOBWARDEN_HOSTNAME")
                .or_else(|| var("HOSTNAME"))
                .unwrap_or_else(|| {
                    warn!("JOBWARDEN_HOSTNAME and HOSTNAME not set; recording jobs as localhost");
                    defaults.hostname
                }),
        }
    }

    pub fn validate(&self) -> Result<(), JobsError> {
        let invalid = |msg: String| -> Result<(), JobsError> { Err(JobsError::InvalidConfig(msg)) };
        if self.store_timeout_ms == 0 {
            return invalid("store timeout must be positive".into());
        }
        if self.keep_alive_secs == 0 {
            return invalid("keep-alive interval must be positive".into());
        }
        if self.mark_dead_after_secs <= self.keep_alive_secs {
            return invalid(format!(
                "jobs would be marked dead after {}s but only send keep-alives every {}s",
                self.mark_dead_after_secs, self.keep_alive_secs
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return invalid("cleanup interval must be positive".into());
        }
        if self.delivery_timeout_ms == 0 {
            return invalid("delivery timeout must be positive".into());
        }
        if self.hostname.trim().is_empty() {
            return invalid("hostname must not be empty".into());
        }
        if self.store == StoreBackend::Postgres && self.database_url.is_none() {
            return invalid("DATABASE_URL must be set for the postgres store".into());
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn mark_dead_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(Duration::from_secs(self.mark_dead_after_secs)).unwrap_or(chrono::Duration::MAX)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

fn parse_or<T, V>(var: &V, name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: core::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|err| {
            warn!(var = name, value = %raw, error = %err, "invalid value; using default");
            default
        }),
        None => default,
    }
}

/// Opens the configured backend.
pub fn build_store(config: &JobsConfig) -> Result<Arc<dyn JobStore>, JobsError> {
    config.validate()?;
    match config.store {
        StoreBackend::InMemory => Ok(InMemoryJobStore::arc()),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => Ok(Arc::new(crate::job_store::RedisJobStore::new(
            &config.redis_url,
            &config.redis_namespace,
            config.store_timeout(),
        )?)),
        #[cfg(feature = "postgres")]
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| JobsError::InvalidConfig("DATABASE_URL must be set for the postgres store".into()))?;
            Ok(Arc::new(crate::job_store::PostgresJobStore::connect(url, config.store_timeout())?))
        }
        #[allow(unreachable_patterns)]
        other => Err(JobsError::InvalidConfig(format!(
            "store backend `{other}` is not compiled in; enable the `{other}` feature"
        ))),
    }
}
