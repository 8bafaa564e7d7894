//! Tagged-answer extraction for model responses.
//!
//! Every stage asks the model for an `<answer>` block. Extraction is a strict
//! slice between fixed open/close markers; a response without the markers is
//! an [`ExtractionError`], recorded on the task rather than raised.
//!
//! # Example
//!
//! ```
//! use sqlforge::utils::answer_extraction::extract_sql_answer;
//!
//! let response = "<answer>\n<sql> SELECT count(*) FROM singer </sql>\n</answer>";
//! assert_eq!(extract_sql_answer(response).unwrap(), "SELECT count(*) FROM singer");
//! ```

use thiserror::Error;

const SQL_OPEN: &str = "<answer>\n<sql>";
const SQL_CLOSE: &str = "</sql>\n</answer>";
const TABLE_OPEN: &str = "<answer>\n<table>";
const TABLE_CLOSE: &str = "</table>\n</answer>";
const TABLE_SEPARATOR: &str = "</table>\n<table>";
const ANSWER_OPEN: &str = "<answer>";
const ANSWER_CLOSE: &str = "</answer>";

/// Error type for answer extraction failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("Extraction Error: missing '{marker}' in model response. Response starts with: '{preview}'")]
    MissingMarker { marker: String, preview: String },

    #[error("Extraction Error: empty {kind} payload in model response")]
    EmptyPayload { kind: &'static str },
}

fn preview(response: &str) -> String {
    response.chars().take(80).collect()
}

/// Returns the text after the first `open` and before the next `close`.
fn slice_between<'a>(response: &'a str, open: &str, close: &str) -> Result<&'a str, ExtractionError> {
    let missing = |marker: &str| ExtractionError::MissingMarker {
        marker: marker.escape_default().to_string(),
        preview: preview(response),
    };
    let start = response.find(open).ok_or_else(|| missing(open))? + open.len();
    let rest = &response[start..];
    let end = rest.find(close).ok_or_else(|| missing(close))?;
    Ok(&rest[..end])
}

/// Extracts the SQL payload from `<answer>\n<sql> ... </sql>\n</answer>`.
pub fn extract_sql_answer(response: &str) -> Result<String, ExtractionError> {
    let sql = slice_between(response, SQL_OPEN, SQL_CLOSE)?.trim();
    if sql.is_empty() {
        return Err(ExtractionError::EmptyPayload { kind: "SQL" });
    }
    Ok(sql.to_string())
}

/// Extracts the raw table names listed as `<table> t </table>` lines, in
/// response order, each trimmed. Quoting and de-duplication are left to the
/// caller.
pub fn extract_table_answer(response: &str) -> Result<Vec<String>, ExtractionError> {
    let body = slice_between(response, TABLE_OPEN, TABLE_CLOSE)?.trim();
    let tables: Vec<String> = body
        .split(TABLE_SEPARATOR)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if tables.is_empty() {
        return Err(ExtractionError::EmptyPayload { kind: "table" });
    }
    Ok(tables)
}

/// Extracts the query from the merge model's `<answer>...</answer>` block,
/// removing a surrounding markdown code fence if present.
pub fn extract_merge_answer(response: &str) -> Result<String, ExtractionError> {
    let mut sql = slice_between(response, ANSWER_OPEN, ANSWER_CLOSE)?.trim();
    if let Some(rest) = sql.strip_prefix("```sql") {
        sql = rest;
    } else if let Some(rest) = sql.strip_prefix("```") {
        sql = rest;
    }
    if let Some(rest) = sql.strip_suffix("```") {
        sql = rest;
    }
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(ExtractionError::EmptyPayload { kind: "SQL" });
    }
    Ok(sql.to_string())
}
