//! Task and partial-result data model.
//!
//! A [`Task`] carries a question's identity, its immutable inputs and the
//! outputs accumulated by every completed stage. A [`StageRecord`] is one
//! row of a stage's persisted partial result: the `question_id` plus the
//! fields that stage produced.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sql::Rows;

/// Identity of a question, unique within a batch and stable across stages.
pub type QuestionId = i64;

/// A single text-to-SQL question flowing through the pipeline.
///
/// Stage-output fields stay `None` until their producing stage completes
/// for this task. Unknown fields (from upstream loaders or future stages)
/// are preserved in `extra` so merging never loses data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub question_id: QuestionId,
    pub db_id: String,
    pub question: String,
    /// Full schema text fed to prompts.
    pub database_schema: String,
    /// Ground-truth SQL, used only by downstream evaluation.
    #[serde(default)]
    pub query: String,
    /// Known-correct tables, used only by downstream evaluation.
    #[serde(default)]
    pub correct_tables: String,

    // table_extraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_tables: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaled_down_db_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_extraction_error: Option<String>,

    // sql_generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_sql_1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_sql_2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_error_1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_error_2: Option<String>,

    // sql_refinement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refined_sql_1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refined_sql_2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql1_final_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql2_final_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql1_exec_results: Option<Rows>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql2_exec_results: Option<Rows>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql1_exec_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql2_exec_time: Option<f64>,

    // sql_selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_rule: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Creates a task from its immutable inputs.
    pub fn new(
        question_id: QuestionId,
        db_id: impl Into<String>,
        question: impl Into<String>,
        database_schema: impl Into<String>,
    ) -> Self {
        Self {
            question_id,
            db_id: db_id.into(),
            question: question.into(),
            database_schema: database_schema.into(),
            ..Self::default()
        }
    }

    /// Sets the ground-truth query.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Sets the known-correct tables.
    pub fn with_correct_tables(mut self, tables: impl Into<String>) -> Self {
        self.correct_tables = tables.into();
        self
    }

    /// Schema text for the reduced-schema track.
    ///
    /// Falls back to the full schema when table extraction produced no
    /// reduced schema for this task.
    pub fn reduced_schema(&self) -> &str {
        match self.scaled_down_db_schema.as_deref() {
            Some(schema) if !schema.trim().is_empty() => schema,
            _ => &self.database_schema,
        }
    }

    /// Builds the merged task view: this task's fields overlaid with every
    /// field contributed by `record`.
    pub fn merged_with(&self, record: &StageRecord) -> Result<Task, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            for (key, field) in &record.fields {
                map.insert(key.clone(), field.clone());
            }
        }
        serde_json::from_value(value)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = self.question.chars().take(50).collect();
        write!(
            f,
            "Task(question_id={}, db_id='{}', question='{}...')",
            self.question_id, self.db_id, preview
        )
    }
}

/// One persisted row of a stage's partial result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub question_id: QuestionId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StageRecord {
    /// Creates an empty record for a question.
    pub fn new(question_id: QuestionId) -> Self {
        Self {
            question_id,
            fields: Map::new(),
        }
    }

    /// Builds a record from a typed stage output that serializes to a JSON
    /// object.
    pub fn from_output<T: Serialize>(
        question_id: QuestionId,
        output: &T,
    ) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(output)? {
            Value::Object(mut fields) => {
                fields.remove("question_id");
                Ok(Self {
                    question_id,
                    fields,
                })
            }
            other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                "stage output must serialize to a JSON object, got {}",
                other
            ))),
        }
    }

    /// Adds a single field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns a produced field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Checks that every field this record carries has the type [`Task`]
    /// expects for it.
    pub fn check_fields(&self) -> Result<(), serde_json::Error> {
        Task::default().merged_with(self).map(|_| ())
    }
}
