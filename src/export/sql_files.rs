//! Line-per-question SQL files consumed by the evaluation scripts.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::StoreError;
use crate::pipeline::task::Task;

pub const GOLD_SQLS: &str = "gold_sqls.sql";
pub const CANDIDATE_SQLS_1: &str = "candidate_sqls_1.sql";
pub const CANDIDATE_SQLS_2: &str = "candidate_sqls_2.sql";
pub const REFINED_SQLS_1: &str = "refined_sqls_1.sql";
pub const REFINED_SQLS_2: &str = "refined_sqls_2.sql";
pub const SELECTED_SQLS: &str = "selected_sqls.sql";
pub const QUESTION_IDS: &str = "question_ids.txt";

/// Collapses a query onto one line.
pub fn flatten_sql(sql: &str) -> String {
    sql.replace(['\n', '\r'], " ")
}

fn write_lines<I>(path: &Path, lines: I) -> Result<(), StoreError>
where
    I: IntoIterator<Item = String>,
{
    let file = File::create(path).map_err(|e| StoreError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for line in lines {
        writeln!(writer, "{}", line).map_err(|e| StoreError::io(path, e))?;
    }
    writer.flush().map_err(|e| StoreError::io(path, e))
}

fn column<'a, F>(tasks: &'a [Task], field: F) -> impl Iterator<Item = String> + 'a
where
    F: Fn(&'a Task) -> Option<&'a str> + 'a,
{
    tasks
        .iter()
        .map(move |task| flatten_sql(field(task).unwrap_or_default()))
}

/// Writes the gold, candidate and question-id files, plus the refined and
/// selected files when `include_final` is set. Returns the files written.
pub fn write_sql_results(
    dir: &Path,
    tasks: &[Task],
    include_final: bool,
) -> Result<Vec<&'static str>, StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    write_lines(
        &dir.join(GOLD_SQLS),
        tasks
            .iter()
            .map(|task| format!("{}\t{}", flatten_sql(&task.query), task.db_id)),
    )?;
    write_lines(
        &dir.join(CANDIDATE_SQLS_1),
        column(tasks, |t| t.candidate_sql_1.as_deref()),
    )?;
    write_lines(
        &dir.join(CANDIDATE_SQLS_2),
        column(tasks, |t| t.candidate_sql_2.as_deref()),
    )?;
    write_lines(
        &dir.join(QUESTION_IDS),
        tasks.iter().map(|task| task.question_id.to_string()),
    )?;

    let mut written = vec![GOLD_SQLS, CANDIDATE_SQLS_1, CANDIDATE_SQLS_2, QUESTION_IDS];
    if include_final {
        write_lines(
            &dir.join(REFINED_SQLS_1),
            column(tasks, |t| t.refined_sql_1.as_deref()),
        )?;
        write_lines(
            &dir.join(REFINED_SQLS_2),
            column(tasks, |t| t.refined_sql_2.as_deref()),
        )?;
        write_lines(
            &dir.join(SELECTED_SQLS),
            column(tasks, |t| t.selected_sql.as_deref()),
        )?;
        written.extend([REFINED_SQLS_1, REFINED_SQLS_2, SELECTED_SQLS]);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flatten_sql() {
        assert_eq!(flatten_sql("SELECT a\nFROM t\r\nWHERE 1"), "SELECT a FROM t  WHERE 1");
    }

    #[test]
    fn test_writes_one_line_per_task() {
        let temp = TempDir::new().expect("temp dir");
        let mut first = Task::new(7, "concert_singer", "q", "s").with_query("SELECT\n1");
        first.candidate_sql_1 = Some("SELECT 1".to_string());
        let second = Task::new(9, "pets_1", "q", "s").with_query("SELECT 2");

        let written = write_sql_results(temp.path(), &[first, second], false).expect("write");

        assert_eq!(written.len(), 4);
        let gold = std::fs::read_to_string(temp.path().join(GOLD_SQLS)).unwrap();
        assert_eq!(gold, "SELECT 1\tconcert_singer\nSELECT 2\tpets_1\n");
        let candidates = std::fs::read_to_string(temp.path().join(CANDIDATE_SQLS_1)).unwrap();
        assert_eq!(candidates, "SELECT 1\n\n");
        let ids = std::fs::read_to_string(temp.path().join(QUESTION_IDS)).unwrap();
        assert_eq!(ids, "7\n9\n");
        assert!(!temp.path().join(SELECTED_SQLS).exists());
    }

    #[test]
    fn test_final_files_written_for_full_runs() {
        let temp = TempDir::new().expect("temp dir");
        let mut task = Task::new(1, "db", "q", "s");
        task.selected_sql = Some("SELECT name\nFROM singer".to_string());

        write_sql_results(temp.path(), &[task], true).expect("write");

        let selected = std::fs::read_to_string(temp.path().join(SELECTED_SQLS)).unwrap();
        assert_eq!(selected, "SELECT name FROM singer\n");
        assert!(temp.path().join(REFINED_SQLS_2).exists());
    }
}
