//! Postgres-backed job store (feature `postgres`).
//!
//! All collections share one table keyed by `(collection, key)`; bodies are
//! JSONB so [`ScanQuery`] filters, ordering and limits run server-side.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS jobwarden_documents (
//!     collection TEXT   NOT NULL,
//!     key        TEXT   NOT NULL,
//!     version    BIGINT NOT NULL,
//!     body       JSONB  NOT NULL,
//!     PRIMARY KEY (collection, key)
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx error | StoreError |
//! |---|---|
//! | database / pool / IO error | `Unavailable` |
//! | lost version check on `replace` (no row updated) | `Conflict` |
//! | operation exceeded the configured timeout | `Unavailable` |
//! | row decoding failure | `Codec` |
//!
//! The [`JobStore`] trait is synchronous. The store owns a small tokio
//! runtime and blocks on it, so callers must not be runtime worker threads.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::runtime::Runtime;

use jobwarden_core::ExpectedVersion;

use super::query::{Condition, ScanQuery};
use super::r#trait::{AppendOptions, Collection, Document, JobStore, StoreError};

pub const TABLE: &str = "jobwarden_documents";

#[derive(Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
    runtime: Runtime,
    timeout: Duration,
}

impl PostgresJobStore {
    /// Connects and makes sure the documents table exists.
    pub fn connect(database_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("jobwarden-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to start postgres runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(8)
                    .acquire_timeout(timeout)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self { pool, runtime, timeout };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                version BIGINT NOT NULL,
                body JSONB NOT NULL,
                PRIMARY KEY (collection, key)
            )"
        );
        self.run("migrate", async { sqlx::query(&ddl).execute(&self.pool).await.map(|_| ()) })
    }

    fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let timeout = self.timeout;
        self.runtime.block_on(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result.map_err(|e| map_sqlx_error(operation, e)),
                Err(_) => Err(StoreError::Unavailable(format!(
                    "{operation} timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        })
    }
}

/// A bind parameter produced while translating a [`ScanQuery`].
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Text(String),
    Json(JsonValue),
    Timestamp(DateTime<Utc>),
    Int(i64),
}

/// Translates a scan into SQL over the documents table.
///
/// Field names are bound as parameters, never spliced into the statement.
pub fn build_scan_sql(collection: Collection, query: &ScanQuery) -> (String, Vec<Bind>) {
    let mut sql = format!("SELECT key, version, body FROM {TABLE} WHERE collection = $1");
    let mut binds = vec![Bind::Text(collection.as_str().to_string())];

    for condition in &query.conditions {
        let field = next(&mut binds, Bind::Text(condition.field().to_string()));
        match condition {
            Condition::Eq(_, value) => {
                let v = next(&mut binds, Bind::Json(value.clone()));
                sql.push_str(&format!(" AND body -> ${field} = ${v}"));
            }
            Condition::Exists(_) => {
                sql.push_str(&format!(" AND COALESCE(body -> ${field}, 'null'::jsonb) <> 'null'::jsonb"));
            }
            Condition::Missing(_) => {
                sql.push_str(&format!(" AND COALESCE(body -> ${field}, 'null'::jsonb) = 'null'::jsonb"));
            }
            Condition::Before(_, instant) => {
                let v = next(&mut binds, Bind::Timestamp(*instant));
                sql.push_str(&format!(" AND (body ->> ${field})::timestamptz < ${v}"));
            }
        }
    }

    match query.newest_first {
        Some(field) => {
            let f = next(&mut binds, Bind::Text(field.to_string()));
            sql.push_str(&format!(" ORDER BY (body ->> ${f})::timestamptz DESC NULLS LAST, key ASC"));
        }
        None => sql.push_str(" ORDER BY key ASC"),
    }

    if let Some(limit) = query.limit {
        let l = next(&mut binds, Bind::Int(limit as i64));
        sql.push_str(&format!(" LIMIT ${l}"));
    }

    (sql, binds)
}

// Pushes a bind and returns its 1-based placeholder index.
fn next(binds: &mut Vec<Bind>, bind: Bind) -> usize {
    binds.push(bind);
    binds.len()
}

fn row_to_document(row: &PgRow) -> Result<Document, sqlx::Error> {
    let version: i64 = row.try_get("version")?;
    Ok(Document {
        key: row.try_get("key")?,
        version: version as u64,
        body: row.try_get("body")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Unavailable(format!("database error {code} in {operation}: {}", db_err.message()))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Codec(format!("failed to decode row in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => StoreError::Unavailable(format!("connection pool closed in {operation}")),
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

impl JobStore for PostgresJobStore {
    fn create_if_absent(&self, collection: Collection, key: &str, body: JsonValue) -> Result<bool, StoreError> {
        let sql = format!(
            "INSERT INTO {TABLE} (collection, key, version, body) VALUES ($1, $2, 1, $3)
             ON CONFLICT (collection, key) DO NOTHING"
        );
        let result = self.run("create_if_absent", async {
            sqlx::query(&sql)
                .bind(collection.as_str())
                .bind(key)
                .bind(&body)
                .execute(&self.pool)
                .await
        })?;
        Ok(result.rows_affected() == 1)
    }

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Document>, StoreError> {
        let sql = format!("SELECT key, version, body FROM {TABLE} WHERE collection = $1 AND key = $2");
        self.run("get", async {
            let row = sqlx::query(&sql)
                .bind(collection.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(row_to_document).transpose()
        })
    }

    fn upsert(&self, collection: Collection, key: &str, body: JsonValue) -> Result<u64, StoreError> {
        let sql = format!(
            "INSERT INTO {TABLE} (collection, key, version, body) VALUES ($1, $2, 1, $3)
             ON CONFLICT (collection, key) DO UPDATE
             SET version = {TABLE}.version + 1, body = EXCLUDED.body
             RETURNING version"
        );
        let version: i64 = self.run("upsert", async {
            sqlx::query(&sql)
                .bind(collection.as_str())
                .bind(key)
                .bind(&body)
                .fetch_one(&self.pool)
                .await?
                .try_get("version")
        })?;
        Ok(version as u64)
    }

    fn replace(
        &self,
        collection: Collection,
        key: &str,
        expected: ExpectedVersion,
        body: JsonValue,
    ) -> Result<u64, StoreError> {
        let expected = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };
        let sql = format!(
            "UPDATE {TABLE} SET version = version + 1, body = $3
             WHERE collection = $1 AND key = $2 AND ($4::bigint IS NULL OR version = $4)
             RETURNING version"
        );
        let row = self.run("replace", async {
            sqlx::query(&sql)
                .bind(collection.as_str())
                .bind(key)
                .bind(&body)
                .bind(expected)
                .fetch_optional(&self.pool)
                .await
        })?;
        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| StoreError::Codec(format!("failed to read version: {e}")))?;
                Ok(version as u64)
            }
            None => Err(StoreError::conflict(collection, key)),
        }
    }

    // Row lock for the read-modify-write; the guard runs on the locked row.
    fn append_to_list(
        &self,
        collection: Collection,
        key: &str,
        field: &str,
        item: JsonValue,
        options: &AppendOptions,
    ) -> Result<bool, StoreError> {
        let select = format!("SELECT key, version, body FROM {TABLE} WHERE collection = $1 AND key = $2 FOR UPDATE");
        let update = format!("UPDATE {TABLE} SET version = version + 1, body = $3 WHERE collection = $1 AND key = $2");

        let outcome: Result<Result<bool, StoreError>, StoreError> = self.run("append_to_list", async {
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query(&select)
                .bind(collection.as_str())
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                tx.rollback().await?;
                return Ok(Ok(false));
            };
            let mut body = row_to_document(&row)?.body;
            match options.apply(&mut body, field, item) {
                Ok(true) => {}
                other => {
                    tx.rollback().await?;
                    return Ok(other);
                }
            }
            sqlx::query(&update)
                .bind(collection.as_str())
                .bind(key)
                .bind(&body)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(Ok(true))
        });
        outcome?
    }

    fn scan(&self, collection: Collection, query: &ScanQuery) -> Result<Vec<Document>, StoreError> {
        let (sql, binds) = build_scan_sql(collection, query);
        self.run("scan", async {
            let mut q = sqlx::query(&sql);
            for bind in &binds {
                q = match bind {
                    Bind::Text(s) => q.bind(s.as_str()),
                    Bind::Json(v) => q.bind(v),
                    Bind::Timestamp(t) => q.bind(*t),
                    Bind::Int(i) => q.bind(*i),
                };
            }
            let rows = q.fetch_all(&self.pool).await?;
            rows.iter().map(row_to_document).collect::<Result<Vec<_>, _>>()
        })
    }

    fn delete_batch(&self, collection: Collection, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {TABLE} WHERE collection = $1 AND key = ANY($2)");
        let result = self.run("delete_batch", async {
            sqlx::query(&sql)
                .bind(collection.as_str())
                .bind(keys)
                .execute(&self.pool)
                .await
        })?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn scan_sql_binds_fields_and_values() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let query = ScanQuery::all()
            .filter(Condition::eq("job_type", "ingest"))
            .filter(Condition::missing("stopped"))
            .filter(Condition::before("last_updated", t))
            .newest_first("started")
            .limit(5);

        let (sql, binds) = build_scan_sql(Collection::Jobs, &query);
        assert_eq!(
            sql,
            "SELECT key, version, body FROM jobwarden_documents WHERE collection = $1 \
             AND body -> $2 = $3 \
             AND COALESCE(body -> $4, 'null'::jsonb) = 'null'::jsonb \
             AND (body ->> $5)::timestamptz < $6 \
             ORDER BY (body ->> $7)::timestamptz DESC NULLS LAST, key ASC LIMIT $8"
        );
        assert_eq!(binds.len(), 8);
        assert_eq!(binds[0], Bind::Text("jobs".to_string()));
        assert_eq!(binds[2], Bind::Json(serde_json::json!("ingest")));
        assert_eq!(binds[5], Bind::Timestamp(t));
        assert_eq!(binds[7], Bind::Int(5));
    }

    #[test]
    fn unfiltered_scan_orders_by_key() {
        let (sql, binds) = build_scan_sql(Collection::RunLocks, &ScanQuery::all());
        assert!(sql.ends_with("WHERE collection = $1 ORDER BY key ASC"));
        assert_eq!(binds.len(), 1);
    }
}
