// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed durable store.
//!
//! Persists one row per path with the record serialized as canonical JSON.
//! WAL mode gives durability with good write performance for a workload of
//! small, frequent upserts.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff (5 attempts, 10 ms
//! base, 500 ms cap) before surfacing a `Store` error.

use crate::error::{ReplicationError, Result};
use crate::store::{path_under_prefix, BoxFuture, Record, ReplicaStore};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error.
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED.
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts, delay_ms, "SQLite busy, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Durable store over a SQLite database file.
pub struct SqliteStore {
    pool: SqlitePool,
    db_path: String,
}

impl SqliteStore {
    /// Open (and create if missing) the database at `path`.
    /// `":memory:"` opens an ephemeral database for tests.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_string_lossy().to_string();
        info!(path = %db_path, "Opening sqlite store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // Single connection: SQLite gives every connection to ":memory:"
        // its own database, and the write volume here does not need more.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                path TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, db_path })
    }

    fn decode(path: &str, raw: &str) -> Result<Record> {
        serde_json::from_str(raw).map_err(|e| {
            ReplicationError::store("decode", format!("corrupt record at {}: {}", path, e))
        })
    }
}

impl ReplicaStore for SqliteStore {
    fn get(&self, path: &str) -> BoxFuture<'_, Option<Record>> {
        let path = path.to_string();
        Box::pin(async move {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT record FROM records WHERE path = ?")
                    .bind(&path)
                    .fetch_optional(&self.pool)
                    .await?;
            match row {
                Some((raw,)) => Ok(Some(Self::decode(&path, &raw)?)),
                None => Ok(None),
            }
        })
    }

    fn put(&self, path: &str, record: Record) -> BoxFuture<'_, ()> {
        let path = path.to_string();
        Box::pin(async move {
            let raw = serde_json::to_string(&record)
                .map_err(|e| ReplicationError::store("encode", e.to_string()))?;
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;

            execute_with_retry("record_put", || {
                let path = path.clone();
                let raw = raw.clone();
                async move {
                    sqlx::query(
                        r#"
                        INSERT INTO records (path, record, updated_at)
                        VALUES (?, ?, ?)
                        ON CONFLICT(path) DO UPDATE SET
                            record = excluded.record,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&path)
                    .bind(&raw)
                    .bind(now)
                    .execute(pool)
                    .await
                }
            })
            .await?;
            Ok(())
        })
    }

    fn del(&self, path: &str) -> BoxFuture<'_, bool> {
        let path = path.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("record_del", || {
                let path = path.clone();
                async move {
                    sqlx::query("DELETE FROM records WHERE path = ?")
                        .bind(&path)
                        .execute(pool)
                        .await
                }
            })
            .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn scan(&self, prefix: &str) -> BoxFuture<'_, Vec<(String, Record)>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            // Range query over the primary key; segment-boundary filtering
            // happens after the fetch.
            let rows: Vec<(String, String)> = if prefix.is_empty() {
                sqlx::query_as("SELECT path, record FROM records ORDER BY path")
                    .fetch_all(&self.pool)
                    .await?
            } else {
                sqlx::query_as(
                    "SELECT path, record FROM records WHERE path = ? OR path LIKE ? ORDER BY path",
                )
                .bind(&prefix)
                .bind(format!("{}/%", prefix))
                .fetch_all(&self.pool)
                .await?
            };

            let mut records = Vec::with_capacity(rows.len());
            for (path, raw) in rows {
                if !path_under_prefix(&path, &prefix) {
                    continue;
                }
                match Self::decode(&path, &raw) {
                    Ok(record) => records.push((path, record)),
                    // One corrupt row must not halt a reconciliation scan.
                    Err(e) => warn!(path = %path, error = %e, "Skipping corrupt record"),
                }
            }
            Ok(records)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Checkpoint the WAL before closing so the main file is current.
            if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await
            {
                warn!(error = %e, "WAL checkpoint failed");
            }
            self.pool.close().await;
            info!(path = %self.db_path, "Sqlite store closed");
            Ok(())
        })
    }
}
