//! SQL execution service.
//!
//! The pipeline only needs "run this query against that database, give me
//! rows or an error, and never block longer than the bound". This module
//! defines that capability ([`SqlExecutor`]), its outcome type and the
//! failure taxonomy that drives refinement and selection:
//!
//! - [`SqlFailure::Execution`] - the engine reported an error (including
//!   timeouts, reported as `"Query timed out."`)
//! - [`SqlFailure::EmptyResult`] - the query ran but produced no rows
//!
//! Empty results are never treated as success.

pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use sqlite::SqliteExecutor;

/// Ordered result rows, each an ordered tuple of JSON values.
pub type Rows = Vec<Vec<Value>>;

/// Message persisted for the empty-result condition.
pub const EMPTY_RESULT_MESSAGE: &str = "Empty result";

/// Message returned when the execution bound elapses.
pub const TIMEOUT_MESSAGE: &str = "Query timed out.";

/// Default wall-clock bound for a single query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Raw result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub rows: Rows,
    /// Engine-reported error, empty when the query ran.
    pub error: String,
    /// Elapsed execution time in seconds.
    pub elapsed: f64,
}

impl ExecutionOutcome {
    pub fn success(rows: Rows, elapsed: f64) -> Self {
        Self {
            rows,
            error: String::new(),
            elapsed,
        }
    }

    pub fn failure(error: impl Into<String>, elapsed: f64) -> Self {
        Self {
            rows: Vec::new(),
            error: error.into(),
            elapsed,
        }
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self::failure(TIMEOUT_MESSAGE, timeout.as_secs_f64())
    }

    /// Re-signals the raw outcome: rows on success, otherwise the failure.
    ///
    /// No rows with no error is [`SqlFailure::EmptyResult`].
    pub fn classify(&self) -> Result<&Rows, SqlFailure> {
        if !self.error.is_empty() {
            return Err(SqlFailure::Execution(self.error.clone()));
        }
        if self.rows.is_empty() {
            return Err(SqlFailure::EmptyResult);
        }
        Ok(&self.rows)
    }
}

/// Why an execution attempt did not yield usable rows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlFailure {
    #[error("{0}")]
    Execution(String),

    #[error("Empty result")]
    EmptyResult,
}

impl SqlFailure {
    /// Recovers the failure class from a persisted error string.
    ///
    /// Returns `None` for the empty string, which marks success.
    pub fn from_message(message: &str) -> Option<Self> {
        match message {
            "" => None,
            EMPTY_RESULT_MESSAGE => Some(Self::EmptyResult),
            other => Some(Self::Execution(other.to_string())),
        }
    }

    pub fn is_empty_result(&self) -> bool {
        matches!(self, Self::EmptyResult)
    }
}

/// Capability to run a query against a named database with a time bound.
///
/// Implementations must return within roughly `timeout` even if the
/// underlying query keeps running; errors are reported in the outcome,
/// never raised.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, db_id: &str, query: &str, timeout: Duration) -> ExecutionOutcome;
}
