//! Result export for evaluation and training data.
//!
//! Reads the final merged record set and writes:
//! - `sql_results/`: one query per line for gold, candidate, refined and
//!   selected SQL, plus the matching question ids
//! - `table_results/`: predicted versus reference tables
//! - `sql_results/additional_data_{1,2}.jsonl` in stop-early mode

pub mod sql_files;
pub mod training_data;

use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::StoreError;
use crate::pipeline::config::DatasetPaths;
use crate::pipeline::engine::RunMode;
use crate::pipeline::task::Task;

pub use sql_files::{flatten_sql, write_sql_results};
pub use training_data::{
    write_additional_data, write_table_results, CandidateExample, TableExtractionRow,
};

/// What an export produced.
#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub records: usize,
    pub files: Vec<PathBuf>,
}

/// Writes every export derived from `tasks` under the dataset directory.
pub fn export_results(
    paths: &DatasetPaths,
    tasks: &[Task],
    mode: RunMode,
) -> Result<ExportSummary, StoreError> {
    let stop_early = mode == RunMode::StopEarly;
    let sql_dir = paths.sql_results_dir();
    let table_dir = paths.table_results_dir();

    let mut files: Vec<PathBuf> = write_sql_results(&sql_dir, tasks, !stop_early)?
        .into_iter()
        .map(|name| sql_dir.join(name))
        .collect();

    match write_table_results(&table_dir, tasks)? {
        Some(path) => files.push(path),
        None => warn!("No table extraction results to write"),
    }

    if stop_early {
        files.extend(write_additional_data(&sql_dir, tasks)?);
    }

    info!(
        records = tasks.len(),
        files = files.len(),
        dir = %paths.dataset_dir().display(),
        "Exported results"
    );
    Ok(ExportSummary {
        records: tasks.len(),
        files,
    })
}
