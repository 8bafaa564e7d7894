//! SQLite-backed execution service.
//!
//! Each database lives at `<root>/<db_id>/<db_id>.sqlite`. Queries run on a
//! detached tokio task; when the bound elapses the caller gets
//! [`TIMEOUT_MESSAGE`](super::TIMEOUT_MESSAGE) immediately and the worker is
//! left to finish on its own, its result discarded. Interrupting a live
//! SQLite connection from outside is not attempted.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Connection, Row, TypeInfo, ValueRef};
use tracing::{debug, warn};

use super::{ExecutionOutcome, Rows, SqlExecutor};

/// Executes queries against per-database SQLite files.
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    db_root_dir: PathBuf,
}

impl SqliteExecutor {
    pub fn new(db_root_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_root_dir: db_root_dir.into(),
        }
    }

    /// Path of the SQLite file for `db_id`.
    pub fn db_path(&self, db_id: &str) -> PathBuf {
        self.db_root_dir.join(db_id).join(format!("{}.sqlite", db_id))
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn execute(&self, db_id: &str, query: &str, timeout: Duration) -> ExecutionOutcome {
        let path = self.db_path(db_id);
        let owned_query = query.to_string();
        let worker = tokio::spawn(async move { run_query(&path, &owned_query).await });

        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                warn!(db_id = db_id, error = %join_error, "SQL worker terminated abnormally");
                ExecutionOutcome::failure(format!("Query worker failed: {}", join_error), 0.0)
            }
            Err(_) => {
                // The JoinHandle is dropped here, which detaches the worker.
                warn!(
                    db_id = db_id,
                    timeout_secs = timeout.as_secs_f64(),
                    query = query,
                    "SQL query timed out"
                );
                ExecutionOutcome::timed_out(timeout)
            }
        }
    }
}

async fn run_query(path: &Path, query: &str) -> ExecutionOutcome {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .read_only(true);

    let mut conn = match SqliteConnection::connect_with(&options).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to open database");
            return ExecutionOutcome::failure(e.to_string(), 0.0);
        }
    };

    let start = Instant::now();
    let result = sqlx::query(query).fetch_all(&mut conn).await;
    let elapsed = start.elapsed().as_secs_f64();

    if let Err(e) = conn.close().await {
        debug!(error = %e, "Failed to close database connection");
    }

    match result {
        Ok(rows) => {
            let values: Rows = rows.iter().map(row_values).collect();
            ExecutionOutcome::success(values, elapsed)
        }
        Err(e) => {
            debug!(error = %e, query = query, "SQL execution error");
            ExecutionOutcome::failure(error_message(&e), elapsed)
        }
    }
}

/// Strips sqlx's wrapper text so the model sees the engine's own message.
fn error_message(error: &sqlx::Error) -> String {
    match error {
        sqlx::Error::Database(db_error) => db_error.message().to_string(),
        other => other.to_string(),
    }
}

fn row_values(row: &SqliteRow) -> Vec<Value> {
    (0..row.len()).map(|index| column_value(row, index)).collect()
}

fn column_value(row: &SqliteRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => row
            .try_get::<i64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" => row
            .try_get::<f64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(index)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{SqlFailure, TIMEOUT_MESSAGE};
    use serde_json::json;
    use sqlx::Executor;
    use tempfile::TempDir;

    async fn create_database(root: &Path, db_id: &str) {
        let dir = root.join(db_id);
        std::fs::create_dir_all(&dir).expect("create db dir");
        let options = SqliteConnectOptions::new()
            .filename(dir.join(format!("{}.sqlite", db_id)))
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .expect("create database");
        conn.execute(
            "CREATE TABLE singer (id INTEGER PRIMARY KEY, name TEXT, age INTEGER, rating REAL);
             INSERT INTO singer (name, age, rating) VALUES ('Joe', 52, 4.5), ('Ann', 33, NULL);
             CREATE TABLE concert (id INTEGER PRIMARY KEY);",
        )
        .await
        .expect("seed database");
        conn.close().await.expect("close");
    }

    #[test]
    fn test_db_path_layout() {
        let executor = SqliteExecutor::new("/data/spider/database");
        assert_eq!(
            executor.db_path("concert_singer"),
            PathBuf::from("/data/spider/database/concert_singer/concert_singer.sqlite")
        );
    }

    #[tokio::test]
    async fn test_execute_returns_typed_rows() {
        let temp = TempDir::new().expect("temp dir");
        create_database(temp.path(), "concert_singer").await;
        let executor = SqliteExecutor::new(temp.path());

        let outcome = executor
            .execute(
                "concert_singer",
                "SELECT name, age, rating FROM singer ORDER BY id",
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(outcome.error, "");
        assert_eq!(
            outcome.rows,
            vec![
                vec![json!("Joe"), json!(52), json!(4.5)],
                vec![json!("Ann"), json!(33), Value::Null],
            ]
        );
        assert!(outcome.elapsed >= 0.0);
    }

    #[tokio::test]
    async fn test_execute_empty_table_classifies_as_empty_result() {
        let temp = TempDir::new().expect("temp dir");
        create_database(temp.path(), "concert_singer").await;
        let executor = SqliteExecutor::new(temp.path());

        let outcome = executor
            .execute("concert_singer", "SELECT id FROM concert", Duration::from_secs(5))
            .await;

        assert_eq!(outcome.error, "");
        assert_eq!(outcome.classify(), Err(SqlFailure::EmptyResult));
    }

    #[tokio::test]
    async fn test_execute_reports_engine_error() {
        let temp = TempDir::new().expect("temp dir");
        create_database(temp.path(), "concert_singer").await;
        let executor = SqliteExecutor::new(temp.path());

        let outcome = executor
            .execute("concert_singer", "SELECT * FROM singers", Duration::from_secs(5))
            .await;

        assert!(outcome.error.contains("no such table"), "got: {}", outcome.error);
        assert!(outcome.rows.is_empty());
    }

    #[tokio::test]
    async fn test_execute_missing_database_is_an_error_value() {
        let temp = TempDir::new().expect("temp dir");
        let executor = SqliteExecutor::new(temp.path());

        let outcome = executor
            .execute("missing_db", "SELECT 1", Duration::from_secs(5))
            .await;

        assert!(!outcome.error.is_empty());
        assert!(!temp.path().join("missing_db").exists());
    }

    #[tokio::test]
    async fn test_timeout_does_not_wait_for_worker() {
        let temp = TempDir::new().expect("temp dir");
        create_database(temp.path(), "concert_singer").await;
        let executor = SqliteExecutor::new(temp.path());

        let slow = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 50000000) \
                    SELECT count(*) FROM c";
        let start = Instant::now();
        let outcome = executor
            .execute("concert_singer", slow, Duration::from_millis(20))
            .await;

        assert_eq!(outcome.error, TIMEOUT_MESSAGE);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
