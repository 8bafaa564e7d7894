//! Staged, resumable batch pipeline.
//!
//! # Architecture
//!
//! - **Task**: a question plus every field produced for it so far
//! - **Stage**: a named [`StageProcessor`] run once per batch on the tasks
//!   that have no persisted result for it yet
//! - **Store**: one JSONL [`PartialResultStore`] per stage, rewritten in full
//!   after every processor call
//! - **Engine**: [`PipelineEngine`] sequencing the stages, owning model
//!   acquisition and release, and merging results forward
//!
//! # Pipeline Flow
//!
//! 1. **Table extraction**: related tables and a reduced schema
//! 2. **Candidate generation**: one query from the reduced schema, one from
//!    the full schema
//! 3. **Refinement**: execution-guided correction of both candidates
//! 4. **Selection**: merge proposal, with a deterministic fallback
//!
//! Rerunning a batch reuses every persisted result, so an interrupted run
//! resumes where it stopped and a completed run performs no model calls.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sqlforge::llm::HttpModelLoader;
//! use sqlforge::pipeline::{ConfigurationRegistry, DatasetPaths, EngineConfig, PipelineEngine, RunMode};
//! use sqlforge::sql::SqliteExecutor;
//! use sqlforge::stages::standard_stages;
//!
//! let config = EngineConfig::from_env()?;
//! let paths = DatasetPaths::new("../outputs/7b", "spider", "data/database", "data/schemas");
//! let executor = Arc::new(SqliteExecutor::new(&paths.db_root_dir));
//!
//! let engine = PipelineEngine::new(
//!     ConfigurationRegistry::with_defaults(),
//!     paths.clone(),
//!     Arc::new(HttpModelLoader::new(config.clone())),
//!     standard_stages(executor, &paths, &config),
//! );
//!
//! let results = engine.execute_batch(tasks, RunMode::Full).await?;
//! ```

pub mod config;
pub mod engine;
pub mod stage;
pub mod store;
pub mod task;

pub use config::{
    ConfigError, ConfigurationRegistry, DatasetPaths, EngineConfig, ModelConfig, ModelKind,
};
pub use engine::{
    PipelineEngine, PipelineError, PipelineRun, PipelineStats, RunMode, StageSet, StageStats,
    STOP_EARLY_STAGE_COUNT,
};
pub use stage::{run_instrumented, StageName, StageProcessor};
pub use store::{read_jsonl, write_jsonl_atomic, PartialResultStore};
pub use task::{QuestionId, StageRecord, Task};
