//! Staged, resumable pipeline engine.
//!
//! For each stage in order the engine:
//! 1. loads the stage's persisted records and splits the incoming tasks into
//!    already-completed and pending
//! 2. when anything is pending, acquires the stage's model, runs the
//!    processor on the pending tasks only, and releases the model whether or
//!    not the call succeeded
//! 3. rewrites the stage store with the persisted plus new records
//! 4. merges each task with its record for the next stage, dropping (and
//!    logging) tasks that have none or whose record does not merge

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::config::{ConfigError, ConfigurationRegistry, DatasetPaths};
use super::stage::{run_instrumented, StageProcessor};
use super::store::PartialResultStore;
use super::task::{QuestionId, StageRecord, Task};
use crate::error::{LlmError, StageError, StoreError};
use crate::llm::ModelLoader;

/// Stages executed in stop-early mode: table extraction and candidate
/// generation.
pub const STOP_EARLY_STAGE_COUNT: usize = 2;

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to load model for stage '{stage}': {source}")]
    ModelLoad {
        stage: String,
        #[source]
        source: LlmError,
    },

    #[error("Stage '{stage}' failed: {source}")]
    StageProcessor {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("No result for question {0} after pipeline run")]
    ResultNotFound(QuestionId),
}

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Full,
    /// Only the first [`STOP_EARLY_STAGE_COUNT`] stages.
    StopEarly,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::StopEarly => write!(f, "stop_early"),
        }
    }
}

/// Ordered stage processors.
#[derive(Clone, Default)]
pub struct StageSet {
    stages: Vec<Arc<dyn StageProcessor>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Arc<dyn StageProcessor>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn for_mode(&self, mode: RunMode) -> &[Arc<dyn StageProcessor>] {
        match mode {
            RunMode::Full => &self.stages,
            RunMode::StopEarly => &self.stages[..self.stages.len().min(STOP_EARLY_STAGE_COUNT)],
        }
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet").field("stages", &self.names()).finish()
    }
}

/// Per-stage counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageStats {
    pub stage: String,
    /// Tasks whose persisted record was reused.
    pub reused: usize,
    /// Tasks submitted to the processor.
    pub processed: usize,
    /// Tasks dropped from the forward chain for lack of a usable record.
    pub dropped: usize,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub stages: Vec<StageStats>,
    /// Model resources acquired across all stages.
    pub model_loads: usize,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_stage(&mut self, stats: StageStats) {
        self.stages.push(stats);
    }

    fn record_model_load(&mut self) {
        self.model_loads += 1;
    }

    /// Total tasks submitted to processors across stages.
    pub fn total_processed(&self) -> usize {
        self.stages.iter().map(|s| s.processed).sum()
    }

    pub fn total_dropped(&self) -> usize {
        self.stages.iter().map(|s| s.dropped).sum()
    }
}

/// Output of one run: merged tasks after the last executed stage.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub tasks: Vec<Task>,
    pub stats: PipelineStats,
}

/// Drives tasks through the configured stages with resume semantics.
pub struct PipelineEngine {
    registry: ConfigurationRegistry,
    paths: DatasetPaths,
    loader: Arc<dyn ModelLoader>,
    stages: StageSet,
}

impl PipelineEngine {
    pub fn new(
        registry: ConfigurationRegistry,
        paths: DatasetPaths,
        loader: Arc<dyn ModelLoader>,
        stages: StageSet,
    ) -> Self {
        Self {
            registry,
            paths,
            loader,
            stages,
        }
    }

    pub fn paths(&self) -> &DatasetPaths {
        &self.paths
    }

    pub fn stages(&self) -> &StageSet {
        &self.stages
    }

    /// Runs `tasks` through the stages for `mode`, returning merged tasks.
    pub async fn execute_batch(
        &self,
        tasks: Vec<Task>,
        mode: RunMode,
    ) -> Result<Vec<Task>, PipelineError> {
        Ok(self.run(tasks, mode).await?.tasks)
    }

    /// Runs a single task as a batch of one and returns its merged result.
    pub async fn execute(&self, task: Task, mode: RunMode) -> Result<Task, PipelineError> {
        let question_id = task.question_id;
        self.execute_batch(vec![task], mode)
            .await?
            .into_iter()
            .find(|t| t.question_id == question_id)
            .ok_or(PipelineError::ResultNotFound(question_id))
    }

    /// Like [`execute_batch`](Self::execute_batch), also returning counters.
    pub async fn run(&self, tasks: Vec<Task>, mode: RunMode) -> Result<PipelineRun, PipelineError> {
        let stages = self.stages.for_mode(mode);

        // Every needed stage must be configured before any model is loaded.
        for stage in stages {
            self.registry.get(stage.name())?;
        }

        info!(
            tasks = tasks.len(),
            stages = stages.len(),
            mode = %mode,
            "Starting pipeline run"
        );

        let mut current = dedup_tasks(tasks);
        let mut stats = PipelineStats::new();
        for stage in stages {
            current = self.process_stage(stage.as_ref(), current, &mut stats).await?;
        }

        info!(
            tasks = current.len(),
            processed = stats.total_processed(),
            dropped = stats.total_dropped(),
            model_loads = stats.model_loads,
            "Pipeline run complete"
        );
        Ok(PipelineRun {
            tasks: current,
            stats,
        })
    }

    async fn process_stage(
        &self,
        stage: &dyn StageProcessor,
        tasks: Vec<Task>,
        stats: &mut PipelineStats,
    ) -> Result<Vec<Task>, PipelineError> {
        let name = stage.name();
        let store = PartialResultStore::new(self.paths.stage_results_path(name));

        let completed = store.load()?;
        let done: HashSet<QuestionId> = completed.iter().map(|r| r.question_id).collect();
        let pending: Vec<Task> = tasks
            .iter()
            .filter(|t| !done.contains(&t.question_id))
            .cloned()
            .collect();

        let mut stage_stats = StageStats {
            stage: name.to_string(),
            reused: tasks.len() - pending.len(),
            processed: pending.len(),
            dropped: 0,
        };

        let mut records = completed;
        if pending.is_empty() {
            info!(
                stage = name,
                reused = stage_stats.reused,
                "All tasks already completed, skipping stage"
            );
        } else {
            let config = self.registry.get(name)?;
            let mut model = self
                .loader
                .load(name, config)
                .await
                .map_err(|source| PipelineError::ModelLoad {
                    stage: name.to_string(),
                    source,
                })?;
            stats.record_model_load();

            let work = stage.process(&pending, model.as_ref());
            let result = run_instrumented(name, pending.len(), work).await;
            model.release().await;

            let produced = result.map_err(|source| PipelineError::StageProcessor {
                stage: name.to_string(),
                source,
            })?;

            records.extend(produced.into_iter().filter(|r| {
                let fresh = !done.contains(&r.question_id);
                if !fresh {
                    warn!(
                        stage = name,
                        question_id = r.question_id,
                        "Ignoring result for already completed task"
                    );
                }
                fresh
            }));
            store.save(&records)?;
        }

        let by_id: HashMap<QuestionId, &StageRecord> =
            records.iter().map(|r| (r.question_id, r)).collect();

        let mut merged = Vec::with_capacity(tasks.len());
        for task in &tasks {
            match by_id.get(&task.question_id) {
                Some(record) => match task.merged_with(record) {
                    Ok(view) => merged.push(view),
                    Err(e) => {
                        warn!(
                            stage = name,
                            question_id = task.question_id,
                            error = %e,
                            "Failed to merge stage result, dropping from pipeline"
                        );
                        stage_stats.dropped += 1;
                    }
                },
                None => {
                    warn!(
                        stage = name,
                        question_id = task.question_id,
                        "No stage result for task, dropping from pipeline"
                    );
                    stage_stats.dropped += 1;
                }
            }
        }

        stats.record_stage(stage_stats);
        Ok(merged)
    }
}

/// Keeps the first task for each `question_id`.
fn dedup_tasks(tasks: Vec<Task>) -> Vec<Task> {
    let mut seen = HashSet::new();
    tasks
        .into_iter()
        .filter(|task| {
            let first = seen.insert(task.question_id);
            if !first {
                warn!(
                    question_id = task.question_id,
                    "Duplicate question_id in batch, keeping first"
                );
            }
            first
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelResource, Prompt};
    use crate::pipeline::config::ModelConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Counters {
        loads: AtomicUsize,
        releases: AtomicUsize,
    }

    struct NullModel {
        stage: String,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl ModelResource for NullModel {
        fn stage(&self) -> &str {
            &self.stage
        }

        async fn produce(&self, _prompt: Prompt) -> Result<Vec<String>, LlmError> {
            Ok(vec![String::new()])
        }

        async fn release(&mut self) {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingLoader(Arc<Counters>);

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(
            &self,
            stage: &str,
            _config: &ModelConfig,
        ) -> Result<Box<dyn ModelResource>, LlmError> {
            self.0.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullModel {
                stage: stage.to_string(),
                counters: Arc::clone(&self.0),
            }))
        }
    }

    /// Writes `<field> = "<stage>:<question_id>"` for every task, optionally
    /// skipping some ids or failing outright.
    struct EchoStage {
        name: &'static str,
        field: &'static str,
        skip: Vec<QuestionId>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl EchoStage {
        fn new(name: &'static str, field: &'static str) -> Self {
            Self {
                name,
                field,
                skip: Vec::new(),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StageProcessor for EchoStage {
        fn name(&self) -> &str {
            self.name
        }

        async fn process(
            &self,
            tasks: &[Task],
            _model: &dyn ModelResource,
        ) -> Result<Vec<StageRecord>, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StageError::InvalidInput("processor exploded".to_string()));
            }
            Ok(tasks
                .iter()
                .filter(|t| !self.skip.contains(&t.question_id))
                .map(|t| {
                    StageRecord::new(t.question_id)
                        .with_field(self.field, format!("{}:{}", self.name, t.question_id))
                })
                .collect())
        }
    }

    fn registry() -> ConfigurationRegistry {
        ConfigurationRegistry::new()
            .with_stage("first", ModelConfig::causal("m"))
            .with_stage("second", ModelConfig::causal("m"))
            .with_stage("third", ModelConfig::causal("m"))
    }

    fn tasks(ids: &[QuestionId]) -> Vec<Task> {
        ids.iter()
            .map(|&id| Task::new(id, "db", format!("question {}", id), "schema"))
            .collect()
    }

    fn engine(
        temp: &TempDir,
        stages: Vec<Arc<EchoStage>>,
        counters: Arc<Counters>,
    ) -> PipelineEngine {
        let set = stages
            .into_iter()
            .fold(StageSet::new(), |set, s| set.with_stage(s));
        PipelineEngine::new(
            registry(),
            DatasetPaths::new(temp.path(), "unit", temp.path(), temp.path()),
            Arc::new(CountingLoader(counters)),
            set,
        )
    }

    #[tokio::test]
    async fn test_fields_flow_through_stages() {
        let temp = TempDir::new().expect("temp dir");
        let counters = Arc::new(Counters::default());
        let first = Arc::new(EchoStage::new("first", "related_tables"));
        let second = Arc::new(EchoStage::new("second", "candidate_sql_1"));
        let engine = engine(&temp, vec![first, second], Arc::clone(&counters));

        let run = engine.run(tasks(&[2, 1]), RunMode::Full).await.expect("run");
        assert_eq!(run.tasks.len(), 2);
        assert_eq!(run.tasks[0].question_id, 2);
        assert_eq!(run.tasks[0].related_tables.as_deref(), Some("first:2"));
        assert_eq!(run.tasks[0].candidate_sql_1.as_deref(), Some("second:2"));
        assert_eq!(run.stats.model_loads, 2);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_stage_config_fails_before_any_load() {
        let temp = TempDir::new().expect("temp dir");
        let counters = Arc::new(Counters::default());
        let first = Arc::new(EchoStage::new("first", "related_tables"));
        let unknown = Arc::new(EchoStage::new("unconfigured", "candidate_sql_1"));
        let engine = engine(&temp, vec![Arc::clone(&first), unknown], Arc::clone(&counters));

        let err = engine.run(tasks(&[1]), RunMode::Full).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::MissingStage(ref s)) if s == "unconfigured"));
        assert_eq!(counters.loads.load(Ordering::SeqCst), 0);
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unmergeable_record_drops_task_and_is_redone() {
        let temp = TempDir::new().expect("temp dir");
        let counters = Arc::new(Counters::default());
        // A string where the task expects seconds.
        let first = Arc::new(EchoStage::new("first", "sql1_exec_time"));
        let second = Arc::new(EchoStage::new("second", "candidate_sql_1"));
        let engine = engine(&temp, vec![Arc::clone(&first), Arc::clone(&second)], counters);

        let run = engine.run(tasks(&[1, 2]), RunMode::Full).await.expect("run");
        assert!(run.tasks.is_empty());
        assert_eq!(run.stats.stages[0].dropped, 2);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);

        let rerun = engine.run(tasks(&[1, 2]), RunMode::Full).await.expect("rerun");
        assert_eq!(rerun.stats.stages[0].reused, 0);
        assert_eq!(rerun.stats.stages[0].processed, 2);
        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tasks_without_record_are_dropped() {
        let temp = TempDir::new().expect("temp dir");
        let counters = Arc::new(Counters::default());
        let mut first = EchoStage::new("first", "related_tables");
        first.skip = vec![2];
        let second = Arc::new(EchoStage::new("second", "candidate_sql_1"));
        let engine = engine(&temp, vec![Arc::new(first), Arc::clone(&second)], counters);

        let run = engine.run(tasks(&[1, 2, 3]), RunMode::Full).await.expect("run");
        let ids: Vec<QuestionId> = run.tasks.iter().map(|t| t.question_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(run.stats.stages[0].dropped, 1);
        assert_eq!(run.stats.stages[1].processed, 2);
    }

    #[tokio::test]
    async fn test_processor_error_releases_then_propagates() {
        let temp = TempDir::new().expect("temp dir");
        let counters = Arc::new(Counters::default());
        let mut failing = EchoStage::new("first", "related_tables");
        failing.fail = true;
        let second = Arc::new(EchoStage::new("second", "candidate_sql_1"));
        let engine = engine(&temp, vec![Arc::new(failing), Arc::clone(&second)], Arc::clone(&counters));

        let err = engine.run(tasks(&[1]), RunMode::Full).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageProcessor { ref stage, .. } if stage == "first"));
        assert_eq!(counters.loads.load(Ordering::SeqCst), 1);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert!(!engine.paths().stage_results_path("first").exists());
    }

    #[tokio::test]
    async fn test_duplicate_question_ids_keep_first() {
        let temp = TempDir::new().expect("temp dir");
        let counters = Arc::new(Counters::default());
        let first = Arc::new(EchoStage::new("first", "related_tables"));
        let engine = engine(&temp, vec![first], counters);

        let mut batch = tasks(&[1, 1]);
        batch[1].question = "duplicate".to_string();
        let out = engine.execute_batch(batch, RunMode::Full).await.expect("run");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].question, "question 1");
    }

    #[tokio::test]
    async fn test_stop_early_runs_first_two_stages() {
        let temp = TempDir::new().expect("temp dir");
        let counters = Arc::new(Counters::default());
        let first = Arc::new(EchoStage::new("first", "related_tables"));
        let second = Arc::new(EchoStage::new("second", "candidate_sql_1"));
        let third = Arc::new(EchoStage::new("third", "refined_sql_1"));
        let engine = engine(&temp, vec![first, second, Arc::clone(&third)], counters);

        let out = engine.execute_batch(tasks(&[1]), RunMode::StopEarly).await.expect("run");
        assert_eq!(out[0].candidate_sql_1.as_deref(), Some("second:1"));
        assert!(out[0].refined_sql_1.is_none());
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_single_task_not_found_when_dropped() {
        let temp = TempDir::new().expect("temp dir");
        let counters = Arc::new(Counters::default());
        let mut first = EchoStage::new("first", "related_tables");
        first.skip = vec![9];
        let engine = engine(&temp, vec![Arc::new(first)], counters);

        let err = engine
            .execute(Task::new(9, "db", "q", "s"), RunMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ResultNotFound(9)));
    }
}
