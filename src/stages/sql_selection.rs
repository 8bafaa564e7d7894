//! Stage 4: final query selection.
//!
//! The merge model sees both refined candidates with their evidence and
//! proposes one query, which is accepted only if it executes with rows.
//! Otherwise [`fallback_select`] decides between the two candidates.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StageError;
use crate::llm::{ModelResource, Prompt};
use crate::pipeline::stage::{StageName, StageProcessor};
use crate::pipeline::task::{StageRecord, Task};
use crate::prompts::{build_merge_prompt, evidence};
use crate::sql::{Rows, SqlExecutor, SqlFailure};
use crate::utils::extract_merge_answer;

/// Failure assumed for a candidate that reached selection without a query.
const MISSING_REFINED_SQL: &str = "No refined SQL";

pub const SOURCE_MERGE: &str = "merge";
pub const SOURCE_FALLBACK: &str = "fallback";

/// Which refined candidate the fallback picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    First,
    Second,
}

/// The fallback case that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackRule {
    BothFailedPreferNonEmptyResult,
    BothFailedSameClass,
    OnlyOneSucceeded,
    SameRowsFaster,
    DifferentRowsFirst,
}

impl FallbackRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BothFailedPreferNonEmptyResult => "both_failed_prefer_non_empty_result",
            Self::BothFailedSameClass => "both_failed_same_class",
            Self::OnlyOneSucceeded => "only_one_succeeded",
            Self::SameRowsFaster => "same_rows_faster",
            Self::DifferentRowsFirst => "different_rows_first",
        }
    }
}

impl fmt::Display for FallbackRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state of one refined candidate as seen by the fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateState {
    pub failure: Option<SqlFailure>,
    pub rows: Rows,
    pub elapsed: f64,
}

impl CandidateState {
    pub fn succeeded(rows: Rows, elapsed: f64) -> Self {
        Self {
            failure: None,
            rows,
            elapsed,
        }
    }

    pub fn failed(failure: SqlFailure) -> Self {
        Self {
            failure: Some(failure),
            rows: Rows::new(),
            elapsed: 0.0,
        }
    }

    fn from_fields(
        sql: Option<&str>,
        error: Option<&str>,
        rows: Option<&Rows>,
        elapsed: Option<f64>,
    ) -> Self {
        let failure = match (sql.map(str::trim), error) {
            (None | Some(""), None | Some("")) => {
                Some(SqlFailure::Execution(MISSING_REFINED_SQL.to_string()))
            }
            (_, Some(message)) => SqlFailure::from_message(message),
            (_, None) => None,
        };
        Self {
            failure,
            rows: rows.cloned().unwrap_or_default(),
            elapsed: elapsed.unwrap_or_default(),
        }
    }
}

/// Ordered decision table over the two refined candidates.
///
/// 1. Both failed: when exactly one failed with an empty result, take the
///    other; otherwise take the first.
/// 2. Exactly one failed: take the one that succeeded.
/// 3. Both succeeded with equal rows: take the faster, the first on a tie.
/// 4. Both succeeded with different rows: take the first.
pub fn fallback_select(first: &CandidateState, second: &CandidateState) -> (Choice, FallbackRule) {
    match (&first.failure, &second.failure) {
        (Some(a), Some(b)) => match (a.is_empty_result(), b.is_empty_result()) {
            (true, false) => (Choice::Second, FallbackRule::BothFailedPreferNonEmptyResult),
            (false, true) => (Choice::First, FallbackRule::BothFailedPreferNonEmptyResult),
            _ => (Choice::First, FallbackRule::BothFailedSameClass),
        },
        (Some(_), None) => (Choice::Second, FallbackRule::OnlyOneSucceeded),
        (None, Some(_)) => (Choice::First, FallbackRule::OnlyOneSucceeded),
        (None, None) if first.rows == second.rows => {
            if first.elapsed <= second.elapsed {
                (Choice::First, FallbackRule::SameRowsFaster)
            } else {
                (Choice::Second, FallbackRule::SameRowsFaster)
            }
        }
        (None, None) => (Choice::First, FallbackRule::DifferentRowsFirst),
    }
}

#[derive(Debug, Serialize)]
struct SelectionOutput {
    selected_sql: String,
    selection_source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    selection_rule: Option<&'static str>,
    status: &'static str,
}

pub struct SqlSelector {
    executor: Arc<dyn SqlExecutor>,
    query_timeout: Duration,
    row_limit: usize,
}

impl SqlSelector {
    pub fn new(executor: Arc<dyn SqlExecutor>, query_timeout: Duration, row_limit: usize) -> Self {
        Self {
            executor,
            query_timeout,
            row_limit,
        }
    }

    /// Asks the merge model for a query and keeps it only if it yields rows.
    async fn try_merge(&self, task: &Task, model: &dyn ModelResource) -> Result<String, String> {
        let sql_1 = task.refined_sql_1.as_deref().unwrap_or_default();
        let sql_2 = task.refined_sql_2.as_deref().unwrap_or_default();
        let no_rows = Rows::new();
        let prompt = build_merge_prompt(
            &task.database_schema,
            &task.question,
            evidence(
                sql_1,
                task.sql1_final_error.as_deref().unwrap_or_default(),
                task.sql1_exec_results.as_ref().unwrap_or(&no_rows),
            ),
            evidence(
                sql_2,
                task.sql2_final_error.as_deref().unwrap_or_default(),
                task.sql2_exec_results.as_ref().unwrap_or(&no_rows),
            ),
            self.row_limit,
        );

        let answer = model
            .produce_one(Prompt::Messages(prompt.into_messages()))
            .await
            .map_err(|e| super::model_call_error(&e))?;
        let merged = extract_merge_answer(&answer).map_err(|e| e.to_string())?;

        let outcome = self
            .executor
            .execute(&task.db_id, &merged, self.query_timeout)
            .await;
        outcome.classify().map_err(|failure| failure.to_string())?;
        Ok(merged)
    }

    fn fallback(&self, task: &Task) -> (String, FallbackRule) {
        let first = CandidateState::from_fields(
            task.refined_sql_1.as_deref(),
            task.sql1_final_error.as_deref(),
            task.sql1_exec_results.as_ref(),
            task.sql1_exec_time,
        );
        let second = CandidateState::from_fields(
            task.refined_sql_2.as_deref(),
            task.sql2_final_error.as_deref(),
            task.sql2_exec_results.as_ref(),
            task.sql2_exec_time,
        );
        let (choice, rule) = fallback_select(&first, &second);
        let chosen = match choice {
            Choice::First => &task.refined_sql_1,
            Choice::Second => &task.refined_sql_2,
        };
        (chosen.clone().unwrap_or_default(), rule)
    }
}

#[async_trait]
impl StageProcessor for SqlSelector {
    fn name(&self) -> &str {
        StageName::SqlSelection.as_str()
    }

    async fn process(
        &self,
        tasks: &[Task],
        model: &dyn ModelResource,
    ) -> Result<Vec<StageRecord>, StageError> {
        let mut records = Vec::with_capacity(tasks.len());
        let mut fallbacks = 0usize;
        for task in tasks {
            let output = match self.try_merge(task, model).await {
                Ok(selected_sql) => {
                    debug!(question_id = task.question_id, "Merged query accepted");
                    SelectionOutput {
                        selected_sql,
                        selection_source: SOURCE_MERGE,
                        selection_rule: None,
                        status: "success",
                    }
                }
                Err(reason) => {
                    let (selected_sql, rule) = self.fallback(task);
                    warn!(
                        question_id = task.question_id,
                        reason = %reason,
                        rule = %rule,
                        "Merge rejected, using fallback selection"
                    );
                    fallbacks += 1;
                    SelectionOutput {
                        selected_sql,
                        selection_source: SOURCE_FALLBACK,
                        selection_rule: Some(rule.as_str()),
                        status: "success",
                    }
                }
            };
            records.push(StageRecord::from_output(task.question_id, &output)?);
        }
        info!(tasks = tasks.len(), fallbacks = fallbacks, "Selection finished");
        Ok(records)
    }
}
