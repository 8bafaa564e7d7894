//! Stage 3: execution-guided refinement of both candidates.
//!
//! Each track executes its candidate, then for up to `max_attempts` rounds
//! feeds the failure back to the model, extracts the corrected query and
//! executes it. A model-call failure or an unparsable answer ends the track
//! immediately. The final error is empty only when the last executed query
//! returned rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::model_call_error;
use crate::error::StageError;
use crate::llm::{ModelResource, Prompt};
use crate::pipeline::stage::{StageName, StageProcessor};
use crate::pipeline::task::{StageRecord, Task};
use crate::prompts::build_sql_refinement_prompt;
use crate::sql::{Rows, SqlExecutor, SqlFailure};
use crate::utils::extract_sql_answer;

/// Failure recorded for a track whose candidate is empty.
pub const NO_CANDIDATE_MESSAGE: &str = "No candidate SQL was produced";

/// Final state of one refinement track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackOutcome {
    /// Last attempted query.
    pub sql: String,
    /// Empty on success.
    pub final_error: String,
    /// Rows of the successful execution, empty otherwise.
    pub rows: Rows,
    /// Elapsed seconds of the last execution.
    pub elapsed: f64,
    pub model_calls: usize,
    pub executions: usize,
}

#[derive(Debug, Serialize)]
struct RefinementOutput {
    refined_sql_1: String,
    refined_sql_2: String,
    sql1_final_error: String,
    sql2_final_error: String,
    sql1_exec_results: Rows,
    sql2_exec_results: Rows,
    sql1_exec_time: f64,
    sql2_exec_time: f64,
    status: &'static str,
}

pub struct SqlRefiner {
    executor: Arc<dyn SqlExecutor>,
    query_timeout: Duration,
    max_attempts: usize,
}

impl SqlRefiner {
    pub fn new(
        executor: Arc<dyn SqlExecutor>,
        query_timeout: Duration,
        max_attempts: usize,
    ) -> Self {
        Self {
            executor,
            query_timeout,
            max_attempts,
        }
    }

    async fn execute(&self, db_id: &str, sql: &str) -> (Result<Rows, SqlFailure>, f64) {
        let outcome = self.executor.execute(db_id, sql, self.query_timeout).await;
        let classified = outcome.classify().cloned();
        (classified, outcome.elapsed)
    }

    /// Refines one candidate against `schema`.
    pub async fn refine_track(
        &self,
        model: &dyn ModelResource,
        task: &Task,
        candidate: &str,
        schema: &str,
        track: u8,
    ) -> TrackOutcome {
        let mut sql = candidate.trim().to_string();
        let mut executions = 0;
        let mut model_calls = 0;

        let (mut result, mut elapsed) = if sql.is_empty() {
            (Err(SqlFailure::Execution(NO_CANDIDATE_MESSAGE.to_string())), 0.0)
        } else {
            executions += 1;
            self.execute(&task.db_id, &sql).await
        };

        for attempt in 1..=self.max_attempts {
            let failure = match &result {
                Ok(_) => break,
                Err(failure) => failure.to_string(),
            };
            debug!(
                question_id = task.question_id,
                track = track,
                attempt = attempt,
                error = %failure,
                "Refining failed query"
            );

            let prompt = build_sql_refinement_prompt(schema, &task.question, &sql, &failure);
            model_calls += 1;
            let answer = match model.produce_one(Prompt::Text(prompt)).await {
                Ok(answer) => answer,
                Err(e) => {
                    warn!(
                        question_id = task.question_id,
                        track = track,
                        error = %e,
                        "Refinement model call failed"
                    );
                    return TrackOutcome {
                        sql,
                        final_error: model_call_error(&e),
                        rows: Rows::new(),
                        elapsed,
                        model_calls,
                        executions,
                    };
                }
            };

            sql = match extract_sql_answer(&answer) {
                Ok(corrected) => corrected,
                Err(e) => {
                    warn!(
                        question_id = task.question_id,
                        track = track,
                        error = %e,
                        "Could not parse refined SQL"
                    );
                    return TrackOutcome {
                        sql,
                        final_error: e.to_string(),
                        rows: Rows::new(),
                        elapsed,
                        model_calls,
                        executions,
                    };
                }
            };

            executions += 1;
            (result, elapsed) = self.execute(&task.db_id, &sql).await;
        }

        let (rows, final_error) = match result {
            Ok(rows) => (rows, String::new()),
            Err(failure) => (Rows::new(), failure.to_string()),
        };
        TrackOutcome {
            sql,
            final_error,
            rows,
            elapsed,
            model_calls,
            executions,
        }
    }
}

#[async_trait]
impl StageProcessor for SqlRefiner {
    fn name(&self) -> &str {
        StageName::SqlRefinement.as_str()
    }

    async fn process(
        &self,
        tasks: &[Task],
        model: &dyn ModelResource,
    ) -> Result<Vec<StageRecord>, StageError> {
        let mut records = Vec::with_capacity(tasks.len());
        for task in tasks {
            let first = self
                .refine_track(
                    model,
                    task,
                    task.candidate_sql_1.as_deref().unwrap_or_default(),
                    task.reduced_schema(),
                    1,
                )
                .await;
            let second = self
                .refine_track(
                    model,
                    task,
                    task.candidate_sql_2.as_deref().unwrap_or_default(),
                    &task.database_schema,
                    2,
                )
                .await;

            debug!(
                question_id = task.question_id,
                sql1_ok = first.final_error.is_empty(),
                sql2_ok = second.final_error.is_empty(),
                model_calls = first.model_calls + second.model_calls,
                "Refined candidates"
            );

            let output = RefinementOutput {
                refined_sql_1: first.sql,
                refined_sql_2: second.sql,
                sql1_final_error: first.final_error,
                sql2_final_error: second.final_error,
                sql1_exec_results: first.rows,
                sql2_exec_results: second.rows,
                sql1_exec_time: first.elapsed,
                sql2_exec_time: second.elapsed,
                status: "success",
            };
            records.push(StageRecord::from_output(task.question_id, &output)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{ExecutionOutcome, EMPTY_RESULT_MESSAGE};
    use crate::stages::testing::{sql_answer, ScriptedExecutor, ScriptedModel};
    use serde_json::json;

    fn refiner(executor: ScriptedExecutor) -> (SqlRefiner, Arc<ScriptedExecutor>) {
        let executor = Arc::new(executor);
        let refiner = SqlRefiner::new(executor.clone(), Duration::from_secs(5), 3);
        (refiner, executor)
    }

    fn task() -> Task {
        Task::new(1, "concert_singer", "How many singers?", "CREATE TABLE singer (id INT);")
    }

    #[tokio::test]
    async fn test_success_on_first_execution_makes_no_model_call() {
        let (refiner, executor) = refiner(
            ScriptedExecutor::new().with("SELECT count(*) FROM singer", ExecutionOutcome::success(vec![vec![json!(6)]], 0.02)),
        );
        let model = ScriptedModel::new(vec![]);

        let outcome = refiner
            .refine_track(&model, &task(), "SELECT count(*) FROM singer", "schema", 1)
            .await;

        assert_eq!(outcome.final_error, "");
        assert_eq!(outcome.rows, vec![vec![json!(6)]]);
        assert_eq!(outcome.elapsed, 0.02);
        assert_eq!(outcome.model_calls, 0);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_error_is_corrected() {
        let (refiner, executor) = refiner(
            ScriptedExecutor::new()
                .with("SELECT count(*) FROM singers", ExecutionOutcome::failure("no such table: singers", 0.0))
                .with("SELECT count(*) FROM singer", ExecutionOutcome::success(vec![vec![json!(6)]], 0.01)),
        );
        let model = ScriptedModel::new(vec![Ok(sql_answer("SELECT count(*) FROM singer"))]);

        let outcome = refiner
            .refine_track(&model, &task(), "SELECT count(*) FROM singers", "schema", 1)
            .await;

        assert_eq!(outcome.sql, "SELECT count(*) FROM singer");
        assert_eq!(outcome.final_error, "");
        assert_eq!(outcome.model_calls, 1);
        assert_eq!(executor.calls(), 2);
        assert!(model.prompts()[0].contains("no such table: singers"));
    }

    #[tokio::test]
    async fn test_empty_result_is_never_success_and_is_bounded() {
        let (refiner, executor) = refiner(ScriptedExecutor::new().with_default(ExecutionOutcome::success(Vec::new(), 0.01)));
        let model = ScriptedModel::new(vec![
            Ok(sql_answer("SELECT 1 WHERE 0")),
            Ok(sql_answer("SELECT 2 WHERE 0")),
            Ok(sql_answer("SELECT 3 WHERE 0")),
            Ok(sql_answer("SELECT 4 WHERE 0")),
        ]);

        let outcome = refiner
            .refine_track(&model, &task(), "SELECT 0 WHERE 0", "schema", 1)
            .await;

        assert_eq!(outcome.final_error, EMPTY_RESULT_MESSAGE);
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.sql, "SELECT 3 WHERE 0");
        assert_eq!(outcome.model_calls, 3);
        assert_eq!(executor.calls(), 4);
        assert_eq!(model.calls(), 3);
        assert!(model.prompts()[0].contains(EMPTY_RESULT_MESSAGE));
    }

    #[tokio::test]
    async fn test_extraction_error_stops_track() {
        let (refiner, executor) = refiner(ScriptedExecutor::new().with_default(ExecutionOutcome::failure("syntax error", 0.0)));
        let model = ScriptedModel::new(vec![Ok("try SELECT 1".to_string()), Ok(sql_answer("SELECT 1"))]);

        let outcome = refiner.refine_track(&model, &task(), "SELEC 1", "schema", 1).await;

        assert_eq!(outcome.sql, "SELEC 1");
        assert!(outcome.final_error.starts_with("Extraction Error"));
        assert_eq!(model.calls(), 1);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_call_error_stops_track() {
        let (refiner, _executor) = refiner(ScriptedExecutor::new().with_default(ExecutionOutcome::failure("syntax error", 0.0)));
        let model = ScriptedModel::new(vec![Err("CUDA out of memory")]);

        let outcome = refiner.refine_track(&model, &task(), "SELEC 1", "schema", 1).await;

        assert!(outcome.final_error.starts_with("Model call error"));
        assert!(outcome.final_error.contains("CUDA out of memory"));
        assert_eq!(outcome.sql, "SELEC 1");
        assert_eq!(outcome.model_calls, 1);
    }

    #[tokio::test]
    async fn test_empty_candidate_is_not_executed() {
        let (refiner, executor) = refiner(ScriptedExecutor::new().with("SELECT 1", ExecutionOutcome::success(vec![vec![json!(1)]], 0.0)));
        let model = ScriptedModel::new(vec![Ok(sql_answer("SELECT 1"))]);

        let outcome = refiner.refine_track(&model, &task(), "  ", "schema", 1).await;

        assert_eq!(outcome.final_error, "");
        assert_eq!(executor.queries(), vec!["SELECT 1".to_string()]);
        assert!(model.prompts()[0].contains(NO_CANDIDATE_MESSAGE));
    }

    #[tokio::test]
    async fn test_process_runs_independent_tracks() {
        let (refiner, _executor) = refiner(
            ScriptedExecutor::new()
                .with("SELECT a FROM t", ExecutionOutcome::success(vec![vec![json!("x")]], 0.1))
                .with("SELECT b FROM t", ExecutionOutcome::failure("no such column: b", 0.0)),
        );
        let model = ScriptedModel::new(vec![Err("down")]);
        let mut task = task();
        task.candidate_sql_1 = Some("SELECT a FROM t".to_string());
        task.candidate_sql_2 = Some("SELECT b FROM t".to_string());
        task.scaled_down_db_schema = Some("REDUCED".to_string());

        let records = refiner.process(&[task], &model).await.expect("process");
        let record = &records[0];
        assert_eq!(record.get("refined_sql_1"), Some(&json!("SELECT a FROM t")));
        assert_eq!(record.get("sql1_final_error"), Some(&json!("")));
        assert_eq!(record.get("sql1_exec_results"), Some(&json!([["x"]])));
        assert_eq!(record.get("sql1_exec_time"), Some(&json!(0.1)));
        assert_eq!(record.get("refined_sql_2"), Some(&json!("SELECT b FROM t")));
        assert!(record.get("sql2_final_error").unwrap().as_str().unwrap().starts_with("Model call error"));
        assert_eq!(record.get("sql2_exec_results"), Some(&json!([])));
        assert_eq!(record.get("status"), Some(&json!("success")));
        // The full-schema track prompts with the full schema.
        assert!(model.prompts()[0].contains("CREATE TABLE singer (id INT);"));
    }
}
