//! CLI command definitions for sqlforge.
//!
//! `run` drives a task file through the staged pipeline and exports the
//! results; `export` regenerates the exports from an existing
//! `pipeline_results.jsonl`.

use crate::export::{export_results, ExportSummary};
use crate::llm::HttpModelLoader;
use crate::pipeline::{
    read_jsonl, write_jsonl_atomic, ConfigurationRegistry, DatasetPaths, EngineConfig,
    PipelineEngine, RunMode, Task,
};
use crate::sql::SqliteExecutor;
use crate::stages::standard_stages;
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_OUTPUT_BASE_DIR: &str = "../outputs/7b";
const DEFAULT_DATASET_NAME: &str = "spider";
const DEFAULT_DB_ROOT_DIR: &str = "../../datasets/Spider/database";
const DEFAULT_DB_SCHEMA_DIR: &str = "../preprocess_data/spider/db_schemas";

/// Staged text-to-SQL batch pipeline.
#[derive(Parser)]
#[command(name = "sqlforge")]
#[command(about = "Run the staged text-to-SQL pipeline over a batch of questions")]
#[command(version)]
#[command(
    long_about = "sqlforge turns natural-language questions into SQL through table extraction, candidate generation, execution-guided refinement and selection.\n\nEvery stage persists its results, so rerunning a batch resumes where it stopped.\n\nExample usage:\n  sqlforge run --tasks dev.jsonl --dataset-name spider --db-root-dir data/database --db-schema-dir data/schemas"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline over a JSONL task file and export the results.
    Run(RunArgs),

    /// Re-export SQL and table files from an existing results file.
    Export(ExportArgs),
}

/// Output locations shared by `run` and `export`.
#[derive(clap::Args, Debug, Clone)]
pub struct OutputArgs {
    /// Base directory for all outputs.
    #[arg(long, default_value = DEFAULT_OUTPUT_BASE_DIR)]
    pub output_base_dir: String,

    /// Dataset name, used as the output subdirectory (e.g. spider, bird).
    #[arg(long, default_value = DEFAULT_DATASET_NAME)]
    pub dataset_name: String,
}

/// Arguments for `sqlforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSONL file of task records (question_id, db_id, question, database_schema, ...).
    #[arg(short, long)]
    pub tasks: String,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Directory holding `<db_id>/<db_id>.sqlite` databases.
    #[arg(long, default_value = DEFAULT_DB_ROOT_DIR)]
    pub db_root_dir: String,

    /// Directory holding `<db_id>_schema.json` description files.
    #[arg(long, default_value = DEFAULT_DB_SCHEMA_DIR)]
    pub db_schema_dir: String,

    /// JSON file mapping stage name to model configuration. Defaults are used when omitted.
    #[arg(long)]
    pub pipeline_configs: Option<String>,

    /// Stop after candidate generation and write additional training data.
    #[arg(long)]
    pub stop_early: bool,

    /// Drop tasks whose full schema text is longer than this many characters.
    #[arg(long)]
    pub max_schema_chars: Option<usize>,

    /// Inference server base URL (overrides SQLFORGE_API_BASE).
    #[arg(long, env = "SQLFORGE_API_BASE")]
    pub api_base: Option<String>,

    /// Output the run summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `sqlforge export`.
#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Results file to export. Defaults to `<output-base-dir>/<dataset-name>/pipeline_results.jsonl`.
    #[arg(short, long)]
    pub results: Option<String>,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Treat the results as a stop-early run.
    #[arg(long)]
    pub stop_early: bool,

    /// Output the export summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct StageSummary {
    stage: String,
    reused: usize,
    processed: usize,
    dropped: usize,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    mode: String,
    input_tasks: usize,
    filtered_tasks: usize,
    completed_tasks: usize,
    model_loads: usize,
    stages: Vec<StageSummary>,
    results_file: String,
    exported_files: usize,
}

#[derive(Debug, Serialize)]
struct ExportOutput {
    results_file: String,
    records: usize,
    files: Vec<String>,
}

fn run_mode(stop_early: bool) -> RunMode {
    if stop_early {
        RunMode::StopEarly
    } else {
        RunMode::Full
    }
}

/// Loads task records, ordered by question id.
fn load_tasks(path: &Path) -> anyhow::Result<Vec<Task>> {
    if !path.exists() {
        anyhow::bail!("Task file does not exist: {}", path.display());
    }
    let mut tasks: Vec<Task> = read_jsonl(path)
        .with_context(|| format!("Failed to read tasks from {}", path.display()))?;
    tasks.sort_by_key(|task| task.question_id);
    Ok(tasks)
}

/// Keeps tasks whose full schema fits within `max_chars`.
pub fn filter_by_schema_length(tasks: Vec<Task>, max_chars: usize) -> (Vec<Task>, usize) {
    let before = tasks.len();
    let kept: Vec<Task> = tasks
        .into_iter()
        .filter(|task| task.database_schema.chars().count() <= max_chars)
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => {
            run_pipeline_command(args).await?;
        }
        Commands::Export(args) => {
            run_export_command(args)?;
        }
    }
    Ok(())
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env()?;
    if let Some(api_base) = args.api_base.clone() {
        config = config.with_api_base(api_base);
    }
    config.validate()?;

    let registry = match &args.pipeline_configs {
        Some(path) => {
            let registry = ConfigurationRegistry::from_file(path)?;
            info!(path = %path, stages = registry.len(), "Loaded pipeline configuration");
            registry
        }
        None => ConfigurationRegistry::with_defaults(),
    };

    let mut tasks = load_tasks(Path::new(&args.tasks))?;
    let input_tasks = tasks.len();
    let mut filtered_tasks = 0;
    if let Some(max_chars) = args.max_schema_chars {
        let (kept, removed) = filter_by_schema_length(tasks, max_chars);
        info!(
            max_chars = max_chars,
            removed = removed,
            kept = kept.len(),
            "Filtered tasks by schema length"
        );
        tasks = kept;
        filtered_tasks = removed;
    }
    if tasks.is_empty() {
        warn!(path = %args.tasks, "No tasks to run");
        return Ok(());
    }

    let paths = DatasetPaths::new(
        &args.output.output_base_dir,
        &args.output.dataset_name,
        &args.db_root_dir,
        &args.db_schema_dir,
    );
    let mode = run_mode(args.stop_early);
    info!(
        tasks = tasks.len(),
        mode = %mode,
        dataset = %paths.dataset_name,
        api_base = %config.api_base,
        "Starting pipeline run"
    );

    let executor = Arc::new(SqliteExecutor::new(&paths.db_root_dir));
    let engine = PipelineEngine::new(
        registry,
        paths.clone(),
        Arc::new(HttpModelLoader::new(config.clone())),
        standard_stages(executor, &paths, &config),
    );

    let mut run = engine.run(tasks, mode).await?;
    run.tasks.sort_by_key(|task| task.question_id);

    let results_path = paths.pipeline_results_path();
    write_jsonl_atomic(&results_path, &run.tasks)?;
    info!(path = %results_path.display(), records = run.tasks.len(), "Wrote pipeline results");

    let summary = export_results(&paths, &run.tasks, mode)?;

    let output = RunOutput {
        mode: mode.to_string(),
        input_tasks,
        filtered_tasks,
        completed_tasks: run.tasks.len(),
        model_loads: run.stats.model_loads,
        stages: run
            .stats
            .stages
            .iter()
            .map(|s| StageSummary {
                stage: s.stage.clone(),
                reused: s.reused,
                processed: s.processed,
                dropped: s.dropped,
            })
            .collect(),
        results_file: results_path.display().to_string(),
        exported_files: summary.files.len(),
    };

    if args.json {
        return print_json(&output);
    }

    if run.stats.total_dropped() > 0 {
        warn!(
            dropped = run.stats.total_dropped(),
            "Some tasks were dropped from the forward chain"
        );
    }
    info!(
        completed = output.completed_tasks,
        model_loads = output.model_loads,
        "Pipeline run finished"
    );
    Ok(())
}

fn run_export_command(args: ExportArgs) -> anyhow::Result<()> {
    // Only the output locations matter for export.
    let paths = DatasetPaths::new(&args.output.output_base_dir, &args.output.dataset_name, "", "");
    let results_path = args
        .results
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.pipeline_results_path());

    if !results_path.exists() {
        anyhow::bail!("Results file does not exist: {}", results_path.display());
    }
    let mut tasks: Vec<Task> = read_jsonl(&results_path)
        .with_context(|| format!("Failed to read results from {}", results_path.display()))?;
    tasks.sort_by_key(|task| task.question_id);

    let ExportSummary { records, files } =
        export_results(&paths, &tasks, run_mode(args.stop_early))?;

    let output = ExportOutput {
        results_file: results_path.display().to_string(),
        records,
        files: files.iter().map(|p| p.display().to_string()).collect(),
    };
    if args.json {
        return print_json(&output);
    }
    info!(records = output.records, files = output.files.len(), "Export finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let args = vec!["sqlforge", "run", "--tasks", "dev.jsonl"];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.tasks, "dev.jsonl");
                assert_eq!(args.output.output_base_dir, DEFAULT_OUTPUT_BASE_DIR);
                assert_eq!(args.output.dataset_name, DEFAULT_DATASET_NAME);
                assert_eq!(args.db_root_dir, DEFAULT_DB_ROOT_DIR);
                assert_eq!(args.db_schema_dir, DEFAULT_DB_SCHEMA_DIR);
                assert!(args.pipeline_configs.is_none());
                assert!(!args.stop_early);
                assert!(args.max_schema_chars.is_none());
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_command_with_all_options() {
        let args = vec![
            "sqlforge",
            "run",
            "-t",
            "bird_dev.jsonl",
            "--output-base-dir",
            "./out",
            "--dataset-name",
            "bird",
            "--db-root-dir",
            "./db",
            "--db-schema-dir",
            "./schemas",
            "--pipeline-configs",
            "configs.json",
            "--stop-early",
            "--max-schema-chars",
            "30000",
            "--log-level",
            "debug",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.output.dataset_name, "bird");
                assert_eq!(args.pipeline_configs.as_deref(), Some("configs.json"));
                assert!(args.stop_early);
                assert_eq!(args.max_schema_chars, Some(30000));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_requires_tasks() {
        assert!(Cli::try_parse_from(["sqlforge", "run"]).is_err());
    }

    #[test]
    fn test_export_command_parses() {
        let cli = Cli::try_parse_from(["sqlforge", "export", "--results", "r.jsonl", "--stop-early", "-j"])
            .expect("should parse");
        match cli.command {
            Commands::Export(args) => {
                assert_eq!(args.results.as_deref(), Some("r.jsonl"));
                assert!(args.stop_early);
                assert!(args.json);
            }
            _ => panic!("Expected Export command"),
        }
    }

    #[test]
    fn test_filter_by_schema_length() {
        let tasks = vec![
            Task::new(1, "db", "q", "short"),
            Task::new(2, "db", "q", "a much longer schema text"),
        ];
        let (kept, removed) = filter_by_schema_length(tasks, 10);
        assert_eq!(removed, 1);
        assert_eq!(kept[0].question_id, 1);
    }

    #[test]
    fn test_load_tasks_sorts_by_question_id() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("tasks.jsonl");
        let lines = [
            r#"{"question_id": 3, "db_id": "db", "question": "c", "database_schema": "s"}"#,
            r#"{"question_id": 1, "db_id": "db", "question": "a", "database_schema": "s"}"#,
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();

        let tasks = load_tasks(&path).expect("load");
        let ids: Vec<i64> = tasks.iter().map(|t| t.question_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_load_tasks_missing_file_is_error() {
        let temp = TempDir::new().expect("temp dir");
        assert!(load_tasks(&temp.path().join("missing.jsonl")).is_err());
    }
}
