//! Prompt templates for table extraction, candidate generation and
//! refinement.
//!
//! Each template asks for a tagged answer block that
//! [`crate::utils::answer_extraction`] slices back out.

use super::fill_template;

/// Prompt for identifying the tables a question touches.
pub const TABLE_EXTRACTION_TEMPLATE: &str = r#"### Task Description
Given the following database schema, your job is to determine the tables that may be involved in answering the question.

### Database Schema
{database_schema}

### Question
{question}

### Response Format
Output the response in the following format:
<answer>
<table> table_1 </table>
<table> table_2 </table>
...
<table> table_n </table>
</answer>
"#;

/// Prompt for generating a SQLite query from a question.
pub const SQL_GENERATION_TEMPLATE: &str = r#"### Task Description
Given the following database schema, your job is to generate the Sqlite SQL query given the user's question.

### Database Schema
{database_schema}

### Question
{question}

### Response Format
Output the response in the following format:
```
<answer>
<sql> SELECT ... </sql>
</answer>
```
"#;

/// Prompt for correcting a query that failed or returned no rows.
pub const SQL_REFINEMENT_TEMPLATE: &str = r#"### Task Description
Given the database schema below, the original question, a candidate SQL query, and an error message from database execution, refine the candidate SQL query to fix the error and make it executable.

### Database Schema
{database_schema}

### Question
{question}

### Candidate SQL
{candidate_sql}

### Error Message
{error_message}

### Response Format
Output the response in the following format:
```
<answer>
<sql> SELECT ... </sql>
</answer>
```
"#;

pub fn build_table_extraction_prompt(database_schema: &str, question: &str) -> String {
    fill_template(
        TABLE_EXTRACTION_TEMPLATE,
        &[("database_schema", database_schema), ("question", question)],
    )
}

pub fn build_sql_generation_prompt(database_schema: &str, question: &str) -> String {
    fill_template(
        SQL_GENERATION_TEMPLATE,
        &[("database_schema", database_schema), ("question", question)],
    )
}

/// Builds the correction prompt for a failing candidate.
///
/// `error_message` is the engine error, or the empty-result message when the
/// query ran but returned no rows.
pub fn build_sql_refinement_prompt(
    database_schema: &str,
    question: &str,
    candidate_sql: &str,
    error_message: &str,
) -> String {
    fill_template(
        SQL_REFINEMENT_TEMPLATE,
        &[
            ("database_schema", database_schema),
            ("question", question),
            ("candidate_sql", candidate_sql),
            ("error_message", error_message),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_extraction_prompt_fills_placeholders() {
        let prompt = build_table_extraction_prompt("CREATE TABLE singer (id INT);", "How many singers?");
        assert!(prompt.contains("CREATE TABLE singer (id INT);"));
        assert!(prompt.contains("### Question\nHow many singers?"));
        assert!(prompt.contains("<table> table_1 </table>"));
        assert!(!prompt.contains("{database_schema}"));
    }

    #[test]
    fn test_generation_prompt_requests_sql_block() {
        let prompt = build_sql_generation_prompt("schema", "question");
        assert!(prompt.contains("<sql> SELECT ... </sql>"));
        assert!(!prompt.contains("{question}"));
    }

    #[test]
    fn test_refinement_prompt_includes_error() {
        let prompt = build_sql_refinement_prompt(
            "CREATE TABLE singer (id INT);",
            "How many singers?",
            "SELECT count(*) FROM singers",
            "no such table: singers",
        );
        assert!(prompt.contains("### Candidate SQL\nSELECT count(*) FROM singers"));
        assert!(prompt.contains("### Error Message\nno such table: singers"));
    }

    #[test]
    fn test_refinement_prompt_keeps_braces_in_inserted_text() {
        let schema = "CREATE TABLE t (tags TEXT DEFAULT '['{error_message}']');";
        let candidate = "SELECT * FROM t WHERE note = '{question}'";
        let prompt = build_sql_refinement_prompt(schema, "How many?", candidate, "no such column: note");

        assert!(prompt.contains(schema));
        assert!(prompt.contains("### Candidate SQL\nSELECT * FROM t WHERE note = '{question}'"));
        assert!(prompt.contains("### Error Message\nno such column: note"));
    }

    #[test]
    fn test_generation_prompt_keeps_braces_in_schema() {
        let prompt = build_sql_generation_prompt("-- {question}", "How many?");
        assert!(prompt.contains("### Database Schema\n-- {question}\n"));
        assert!(prompt.contains("### Question\nHow many?"));
    }
}
