//! JSONL exports: table-extraction evaluation rows and the candidate
//! training pairs written in stop-early mode.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::pipeline::store::write_jsonl_atomic;
use crate::pipeline::task::{QuestionId, Task};

pub const TABLE_EXTRACTION_RESULTS: &str = "table_extraction_results.jsonl";
pub const ADDITIONAL_DATA_1: &str = "additional_data_1.jsonl";
pub const ADDITIONAL_DATA_2: &str = "additional_data_2.jsonl";

/// Predicted versus reference tables for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableExtractionRow {
    pub question_id: QuestionId,
    pub predicted_tables: String,
    pub reference_tables: String,
}

/// A (question, schema, candidate) pair for downstream fine-tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateExample {
    pub question: String,
    pub database_schema: String,
    pub candidate_sql: String,
}

pub fn write_table_results(dir: &Path, tasks: &[Task]) -> Result<Option<PathBuf>, StoreError> {
    if tasks.is_empty() {
        return Ok(None);
    }
    let rows: Vec<TableExtractionRow> = tasks
        .iter()
        .map(|task| TableExtractionRow {
            question_id: task.question_id,
            predicted_tables: task.related_tables.clone().unwrap_or_default(),
            reference_tables: task.correct_tables.clone(),
        })
        .collect();
    let path = dir.join(TABLE_EXTRACTION_RESULTS);
    write_jsonl_atomic(&path, &rows)?;
    Ok(Some(path))
}

/// Candidate 1 is paired with the reduced schema it was generated from,
/// candidate 2 with the full schema.
pub fn write_additional_data(dir: &Path, tasks: &[Task]) -> Result<Vec<PathBuf>, StoreError> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    let first: Vec<CandidateExample> = tasks
        .iter()
        .map(|task| CandidateExample {
            question: task.question.clone(),
            database_schema: task.scaled_down_db_schema.clone().unwrap_or_default(),
            candidate_sql: task.candidate_sql_1.clone().unwrap_or_default(),
        })
        .collect();
    let second: Vec<CandidateExample> = tasks
        .iter()
        .map(|task| CandidateExample {
            question: task.question.clone(),
            database_schema: task.database_schema.clone(),
            candidate_sql: task.candidate_sql_2.clone().unwrap_or_default(),
        })
        .collect();

    let first_path = dir.join(ADDITIONAL_DATA_1);
    let second_path = dir.join(ADDITIONAL_DATA_2);
    write_jsonl_atomic(&first_path, &first)?;
    write_jsonl_atomic(&second_path, &second)?;
    Ok(vec![first_path, second_path])
}
