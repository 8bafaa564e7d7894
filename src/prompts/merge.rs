//! Merge prompt for the selection stage.
//!
//! The merge model sees both refined candidates together with their
//! execution evidence and proposes one query.

use serde_json::Value;

use super::fill_template;
use crate::llm::Message;
use crate::sql::Rows;

/// Marker appended when evidence rows were cut.
pub const TRUNCATION_MARKER: &str = "...";

/// System prompt for the merge model.
pub const MERGE_SYSTEM_PROMPT: &str = "You are a helpful AI Assistant that provides well-reasoned and detailed responses. You first think about the reasoning process as an internal monologue and then provide the user with the answer. Respond in the following format: <think>\n...\n</think>\n<answer>\n...\n</answer>";

const MERGE_USER_TEMPLATE: &str = r#"You first thinks about the reasoning process in the mind and then provides the user with the answer.

Task Overview:
You are a data science expert. Below, you are provided with a database schema, a natural language question, some draft SQL and its corresponding execution result. Your task is to understand the schema and generate a valid SQL query to answer the question.

Database Engine:
SQLite

Database Schema:
{database_schema}
This schema describes the database's structure, including tables, columns, primary keys, foreign keys, and any relevant relationships or constraints.

Question:
{question}

Here are some corresponding draft SQL and execute result:
1. {candidate_sql_1}
【Execution result】
{sql1_exec_results}

2. {candidate_sql_2}
【Execution result】
{sql2_exec_results}

Instructions:
- Make sure you only output the information that is asked in the question. If the question asks for a specific column, make sure to only include that column in the SELECT clause, nothing more.
- The generated query should return all of the information asked in the question without any missing or extra information.
- Before generating the final SQL query, please think through the steps of how to write the query.

Output Format:
Show your work in <think> </think> tags. And return the final SQLite SQL query that starts with keyword `SELECT` in <answer> </answer> tags, for example <answer>SELECT AVG(rating_score) FROM movies</answer>.

Let me solve this step by step.
"#;

/// One refined candidate as shown to the merge model.
#[derive(Debug, Clone, Copy)]
pub struct CandidateEvidence<'a> {
    pub sql: &'a str,
    /// Final error, empty on success.
    pub error: &'a str,
    pub rows: &'a [Vec<Value>],
}

impl CandidateEvidence<'_> {
    /// Text placed under the candidate's execution-result heading: the
    /// error when there is one, otherwise the truncated rows.
    pub fn render(&self, row_limit: usize) -> String {
        if !self.error.is_empty() {
            return self.error.to_string();
        }
        render_rows(self.rows, row_limit)
    }
}

/// Renders at most `limit` rows as one compact JSON array, followed by
/// [`TRUNCATION_MARKER`] when rows were cut.
pub fn render_rows(rows: &[Vec<Value>], limit: usize) -> String {
    let shown: Vec<Value> = rows
        .iter()
        .take(limit)
        .map(|row| Value::Array(row.clone()))
        .collect();
    let mut rendered = Value::Array(shown).to_string();
    if rows.len() > limit {
        rendered.push_str(TRUNCATION_MARKER);
    }
    rendered
}

/// System and user messages for one merge call.
#[derive(Debug, Clone)]
pub struct MergePrompt {
    pub system: String,
    pub user: String,
}

impl MergePrompt {
    pub fn into_messages(self) -> Vec<Message> {
        vec![Message::system(self.system), Message::user(self.user)]
    }
}

pub fn build_merge_prompt(
    database_schema: &str,
    question: &str,
    first: CandidateEvidence<'_>,
    second: CandidateEvidence<'_>,
    row_limit: usize,
) -> MergePrompt {
    let first_result = first.render(row_limit);
    let second_result = second.render(row_limit);
    let user = fill_template(
        MERGE_USER_TEMPLATE,
        &[
            ("database_schema", database_schema),
            ("question", question),
            ("candidate_sql_1", first.sql),
            ("sql1_exec_results", &first_result),
            ("candidate_sql_2", second.sql),
            ("sql2_exec_results", &second_result),
        ],
    );

    MergePrompt {
        system: MERGE_SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Convenience for evidence built from owned rows.
pub fn evidence<'a>(sql: &'a str, error: &'a str, rows: &'a Rows) -> CandidateEvidence<'a> {
    CandidateEvidence {
        sql,
        error,
        rows: rows.as_slice(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> Rows {
        (0..n).map(|i| vec![json!(i), json!(format!("name{}", i))]).collect()
    }

    fn shown_rows(rendered: &str) -> usize {
        let json = rendered.trim_end_matches(TRUNCATION_MARKER);
        serde_json::from_str::<Vec<Value>>(json).expect("json rows").len()
    }

    #[test]
    fn test_render_rows_truncates_past_limit() {
        let rendered = render_rows(&rows(15), 10);
        assert!(rendered.ends_with(TRUNCATION_MARKER));
        assert_eq!(shown_rows(&rendered), 10);
        assert!(rendered.starts_with(r#"[[0,"name0"],"#));
        assert!(rendered.contains(r#"[9,"name9"]]"#));
    }

    #[test]
    fn test_render_rows_under_limit_has_no_marker() {
        let rendered = render_rows(&rows(5), 10);
        assert_eq!(shown_rows(&rendered), 5);
        assert!(!rendered.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn test_render_rows_exactly_at_limit_has_no_marker() {
        let rendered = render_rows(&rows(10), 10);
        assert_eq!(shown_rows(&rendered), 10);
        assert!(!rendered.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn test_error_evidence_shows_error_text() {
        let empty = Rows::new();
        let candidate = evidence("SELECT x FROM t", "no such column: x", &empty);
        assert_eq!(candidate.render(10), "no such column: x");
    }

    #[test]
    fn test_merge_prompt_truncates_each_candidate_independently() {
        let many = rows(15);
        let few = rows(3);
        let prompt = build_merge_prompt(
            "CREATE TABLE t (id INT);",
            "List ids",
            evidence("SELECT id FROM t", "", &many),
            evidence("SELECT id, name FROM t", "", &few),
            10,
        );
        assert!(prompt.user.contains(TRUNCATION_MARKER));
        assert!(prompt
            .user
            .contains("1. SELECT id FROM t\n【Execution result】\n[[0,\"name0\"],"));
        assert!(prompt.user.contains("[2,\"name2\"]]\n\nInstructions:"));
        assert!(!prompt.user.contains("[10,\"name10\"]"));

        let messages = prompt.into_messages();
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
    }

    #[test]
    fn test_merge_prompt_keeps_braces_in_candidates_and_rows() {
        let braced = vec![vec![json!("{candidate_sql_2}")]];
        let empty = Rows::new();
        let prompt = build_merge_prompt(
            "CREATE TABLE t (note TEXT);",
            "How many?",
            evidence("SELECT * FROM t WHERE note = '{question}'", "", &braced),
            evidence("SELECT note FROM t", "no such column: {note}", &empty),
            10,
        );

        assert!(prompt.user.contains("1. SELECT * FROM t WHERE note = '{question}'\n"));
        assert!(prompt.user.contains("【Execution result】\n[[\"{candidate_sql_2}\"]]"));
        assert!(prompt
            .user
            .contains("2. SELECT note FROM t\n【Execution result】\nno such column: {note}"));
        assert!(prompt.user.contains("Question:\nHow many?"));
    }
}
