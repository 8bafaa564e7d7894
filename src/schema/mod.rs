//! Schema description files and reduced-schema construction.
//!
//! A description file (`<db_id>_schema.json`) maps each table to its columns
//! plus an optional `<<key_info>>` entry holding key constraint text:
//!
//! ```json
//! {
//!   "singer": {
//!     "singer_id": {"type": "INTEGER", "constraints": ["PRIMARY KEY"], "description": "id"},
//!     "name": {"type": "TEXT", "examples": [{"question_id": "12", "values": ["Joe"]}]},
//!     "<<key_info>>": "FOREIGN KEY (x) REFERENCES y (x)"
//!   }
//! }
//! ```
//!
//! [`SchemaDescription::render`] turns the tables chosen by table extraction
//! into `CREATE TABLE` text for the reduced-schema prompts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::task::QuestionId;

const KEY_INFO: &str = "<<key_info>>";

/// Errors reading a schema description file.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read schema file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse schema file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn non_word() -> &'static Regex {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    NON_WORD.get_or_init(|| Regex::new(r"\W").expect("Invalid regex for non-word characters"))
}

/// Normalizes a table or column name: trimmed, lowercased, and wrapped in
/// backticks when it contains a non-word character.
pub fn quote_field(name: &str) -> String {
    let name = name.trim().to_lowercase();
    if non_word().is_match(&name) {
        format!("`{}`", name)
    } else {
        name
    }
}

#[derive(Debug, Default, Deserialize)]
struct ColumnInfo {
    #[serde(default, rename = "type")]
    column_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    details: String,
    #[serde(default)]
    constraints: Vec<String>,
    #[serde(default)]
    examples: Vec<ColumnExample>,
}

#[derive(Debug, Deserialize)]
struct ColumnExample {
    #[serde(default)]
    question_id: Value,
    #[serde(default)]
    values: Option<Value>,
}

impl ColumnExample {
    fn matches(&self, question_id: QuestionId) -> bool {
        match &self.question_id {
            Value::String(id) => id.trim() == question_id.to_string(),
            Value::Number(id) => id.as_i64() == Some(question_id),
            _ => false,
        }
    }
}

impl ColumnInfo {
    fn render(&self, name: &str, question_id: Option<QuestionId>) -> String {
        let mut line = format!(
            "{} {} {},",
            name,
            self.column_type,
            self.constraints.join(" ")
        );

        let comment = format!("{}{}", self.description, self.details);
        if !comment.is_empty() {
            line.push_str(" -- ");
            line.push_str(&comment);
        }

        let example = question_id.and_then(|qid| {
            self.examples
                .iter()
                .find(|ex| ex.matches(qid))
                .and_then(|ex| ex.values.as_ref())
        });
        if let Some(values) = example {
            line.push_str(if comment.is_empty() { " -- " } else { " " });
            line.push_str("Example: ");
            line.push_str(&values.to_string());
        }

        line.trim().to_string()
    }
}

/// Parsed schema description for one database, tables in file order.
#[derive(Debug, Clone, Default)]
pub struct SchemaDescription {
    tables: Map<String, Value>,
}

impl SchemaDescription {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            tables: serde_json::from_str(raw)?,
        })
    }

    /// Loads a description file; a missing file is `Ok(None)`.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, SchemaError> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SchemaError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_json_str(&raw)
            .map(Some)
            .map_err(|source| SchemaError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Renders `CREATE TABLE` text for every described table whose quoted
    /// name is in `related_tables`, joined by blank lines.
    ///
    /// Column examples are included only for the entry tagged with
    /// `question_id`.
    pub fn render(&self, related_tables: &[String], question_id: Option<QuestionId>) -> String {
        let related: HashSet<&str> = related_tables.iter().map(String::as_str).collect();
        let mut statements = Vec::new();

        for (table_name, table_info) in &self.tables {
            if !related.contains(quote_field(table_name).as_str()) {
                continue;
            }
            let Some(columns) = table_info.as_object() else {
                debug!(table = %table_name, "Skipping non-object table entry");
                continue;
            };

            let mut lines = Vec::new();
            for (column_name, column_value) in columns {
                if column_name == KEY_INFO {
                    continue;
                }
                match ColumnInfo::deserialize(column_value) {
                    Ok(info) => lines.push(info.render(column_name, question_id)),
                    Err(e) => {
                        debug!(
                            table = %table_name,
                            column = %column_name,
                            error = %e,
                            "Skipping malformed column entry"
                        )
                    }
                }
            }

            let key_info = columns
                .get(KEY_INFO)
                .and_then(Value::as_str)
                .unwrap_or_default();

            statements.push(format!(
                "CREATE TABLE {} (\n    {}\n    {}\n);",
                table_name,
                lines.join("\n    "),
                key_info
            ));
        }

        statements.join("\n\n")
    }
}

/// Reduced schema for a task from its database's description file.
///
/// A missing or unreadable file yields an empty schema with a warning, so
/// downstream stages fall back to the full schema.
pub fn build_reduced_schema(
    schema_file: &Path,
    related_tables: &[String],
    question_id: QuestionId,
) -> String {
    match SchemaDescription::load(schema_file) {
        Ok(Some(description)) => description.render(related_tables, Some(question_id)),
        Ok(None) => {
            warn!(path = %schema_file.display(), "Schema description file not found");
            String::new()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load schema description");
            String::new()
        }
    }
}
