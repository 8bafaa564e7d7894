//! Stage 2: two candidate queries per task.
//!
//! Candidate 1 is generated from the reduced schema (or the full schema when
//! table extraction produced none), candidate 2 from the full schema.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use super::model_call_error;
use crate::error::StageError;
use crate::llm::{ModelResource, Prompt};
use crate::pipeline::stage::{StageName, StageProcessor};
use crate::pipeline::task::{QuestionId, StageRecord, Task};
use crate::prompts::build_sql_generation_prompt;
use crate::utils::extract_sql_answer;

#[derive(Debug, Serialize)]
struct GenerationOutput {
    candidate_sql_1: String,
    candidate_sql_2: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate_error_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate_error_2: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateGenerator;

impl CandidateGenerator {
    pub fn new() -> Self {
        Self
    }

    /// One generation call; failures yield an empty candidate plus the error.
    async fn generate(
        &self,
        model: &dyn ModelResource,
        question_id: QuestionId,
        schema: &str,
        question: &str,
        track: u8,
    ) -> (String, Option<String>) {
        let prompt = build_sql_generation_prompt(schema, question);
        let answer = match model.produce_one(Prompt::Text(prompt)).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(
                    question_id = question_id,
                    track = track,
                    error = %e,
                    "Generation model call failed"
                );
                return (String::new(), Some(model_call_error(&e)));
            }
        };
        match extract_sql_answer(&answer) {
            Ok(sql) => (sql, None),
            Err(e) => {
                warn!(
                    question_id = question_id,
                    track = track,
                    error = %e,
                    "Could not parse generated SQL"
                );
                (String::new(), Some(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl StageProcessor for CandidateGenerator {
    fn name(&self) -> &str {
        StageName::SqlGeneration.as_str()
    }

    async fn process(
        &self,
        tasks: &[Task],
        model: &dyn ModelResource,
    ) -> Result<Vec<StageRecord>, StageError> {
        let mut records = Vec::with_capacity(tasks.len());
        for task in tasks {
            let (candidate_sql_1, candidate_error_1) = self
                .generate(model, task.question_id, task.reduced_schema(), &task.question, 1)
                .await;
            let (candidate_sql_2, candidate_error_2) = self
                .generate(model, task.question_id, &task.database_schema, &task.question, 2)
                .await;

            let output = GenerationOutput {
                candidate_sql_1,
                candidate_sql_2,
                candidate_error_1,
                candidate_error_2,
            };
            records.push(StageRecord::from_output(task.question_id, &output)?);
        }
        Ok(records)
    }
}
