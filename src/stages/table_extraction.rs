//! Stage 1: related-table extraction and reduced-schema construction.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::model_call_error;
use crate::error::StageError;
use crate::llm::{ModelResource, Prompt};
use crate::pipeline::config::DatasetPaths;
use crate::pipeline::stage::{StageName, StageProcessor};
use crate::pipeline::task::{StageRecord, Task};
use crate::prompts::build_table_extraction_prompt;
use crate::schema::{build_reduced_schema, quote_field};
use crate::utils::extract_table_answer;

#[derive(Debug, Serialize)]
struct TableExtractionOutput {
    related_tables: String,
    scaled_down_db_schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    table_extraction_error: Option<String>,
}

/// Quotes each name and drops repeats, keeping first occurrences in order.
pub fn normalize_tables(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|t| quote_field(t))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Asks the model which tables a question needs and renders the reduced
/// schema for them from the database's description file.
#[derive(Debug, Clone)]
pub struct TableExtractor {
    paths: DatasetPaths,
}

impl TableExtractor {
    pub fn new(paths: DatasetPaths) -> Self {
        Self { paths }
    }

    async fn extract(&self, task: &Task, model: &dyn ModelResource) -> TableExtractionOutput {
        let prompt = build_table_extraction_prompt(&task.database_schema, &task.question);

        let failed = |error: String| TableExtractionOutput {
            related_tables: String::new(),
            scaled_down_db_schema: String::new(),
            table_extraction_error: Some(error),
        };

        let answer = match model.produce_one(Prompt::Text(prompt)).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(
                    question_id = task.question_id,
                    error = %e,
                    "Table extraction model call failed"
                );
                return failed(model_call_error(&e));
            }
        };

        let tables = match extract_table_answer(&answer) {
            Ok(raw) => normalize_tables(&raw),
            Err(e) => {
                warn!(
                    question_id = task.question_id,
                    error = %e,
                    "Could not parse table extraction answer"
                );
                return failed(e.to_string());
            }
        };

        let schema_file = self.paths.schema_file(&task.db_id);
        let scaled_down_db_schema = build_reduced_schema(&schema_file, &tables, task.question_id);
        debug!(
            question_id = task.question_id,
            tables = tables.len(),
            schema_chars = scaled_down_db_schema.len(),
            "Extracted related tables"
        );

        TableExtractionOutput {
            related_tables: tables.join(", "),
            scaled_down_db_schema,
            table_extraction_error: None,
        }
    }
}

#[async_trait]
impl StageProcessor for TableExtractor {
    fn name(&self) -> &str {
        StageName::TableExtraction.as_str()
    }

    async fn process(
        &self,
        tasks: &[Task],
        model: &dyn ModelResource,
    ) -> Result<Vec<StageRecord>, StageError> {
        let mut records = Vec::with_capacity(tasks.len());
        for task in tasks {
            let output = self.extract(task, model).await;
            records.push(StageRecord::from_output(task.question_id, &output)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::ScriptedModel;
    use serde_json::json;
    use tempfile::TempDir;

    const DESCRIPTION: &str = r#"{
        "singer": {"name": {"type": "TEXT"}, "<<key_info>>": ""},
        "concert": {"year": {"type": "TEXT"}, "<<key_info>>": ""},
        "stadium": {"capacity": {"type": "INTEGER"}, "<<key_info>>": ""}
    }"#;

    fn paths(temp: &TempDir) -> DatasetPaths {
        DatasetPaths::new(temp.path(), "unit", temp.path(), temp.path())
    }

    #[test]
    fn test_normalize_tables_dedups_in_order() {
        let raw = vec![
            "Singer".to_string(),
            "concert".to_string(),
            "singer".to_string(),
            "Sales Orders".to_string(),
        ];
        assert_eq!(
            normalize_tables(&raw),
            vec!["singer", "concert", "`sales orders`"]
        );
    }

    #[tokio::test]
    async fn test_extracts_tables_and_reduced_schema() {
        let temp = TempDir::new().expect("temp dir");
        std::fs::write(temp.path().join("concert_singer_schema.json"), DESCRIPTION).unwrap();
        let model = ScriptedModel::new(vec![Ok(
            "<answer>\n<table> concert </table>\n<table> Singer </table>\n</answer>".to_string(),
        )]);
        let task = Task::new(4, "concert_singer", "Which singers performed in 2014?", "full schema");

        let records = TableExtractor::new(paths(&temp))
            .process(&[task], &model)
            .await
            .expect("process");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("related_tables"), Some(&json!("concert, singer")));
        let schema = records[0].get("scaled_down_db_schema").unwrap().as_str().unwrap();
        assert!(schema.contains("CREATE TABLE singer"));
        assert!(schema.contains("CREATE TABLE concert"));
        assert!(!schema.contains("stadium"));
        assert!(records[0].get("table_extraction_error").is_none());
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_answer_is_recorded_not_raised() {
        let temp = TempDir::new().expect("temp dir");
        let model = ScriptedModel::new(vec![Ok("singer, concert".to_string()), Ok(
            "<answer>\n<table> singer </table>\n</answer>".to_string(),
        )]);
        let tasks = vec![
            Task::new(1, "concert_singer", "q1", "s"),
            Task::new(2, "concert_singer", "q2", "s"),
        ];

        let records = TableExtractor::new(paths(&temp))
            .process(&tasks, &model)
            .await
            .expect("process");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("related_tables"), Some(&json!("")));
        let error = records[0].get("table_extraction_error").unwrap().as_str().unwrap();
        assert!(error.starts_with("Extraction Error"));
        // Missing schema file leaves the reduced schema empty.
        assert_eq!(records[1].get("related_tables"), Some(&json!("singer")));
        assert_eq!(records[1].get("scaled_down_db_schema"), Some(&json!("")));
    }

    #[tokio::test]
    async fn test_model_error_is_recorded() {
        let temp = TempDir::new().expect("temp dir");
        let model = ScriptedModel::new(vec![Err("backend down")]);
        let records = TableExtractor::new(paths(&temp))
            .process(&[Task::new(1, "db", "q", "s")], &model)
            .await
            .expect("process");

        let error = records[0].get("table_extraction_error").unwrap().as_str().unwrap();
        assert!(error.starts_with("Model call error"));
    }
}
