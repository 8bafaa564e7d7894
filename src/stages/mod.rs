//! The four text-to-SQL stage processors.
//!
//! | Stage | Processor | Adds |
//! |-------|-----------|------|
//! | `table_extraction` | [`TableExtractor`] | `related_tables`, `scaled_down_db_schema` |
//! | `sql_generation` | [`CandidateGenerator`] | `candidate_sql_1`, `candidate_sql_2` |
//! | `sql_refinement` | [`SqlRefiner`] | `refined_sql_*`, `sql*_final_error`, `sql*_exec_*` |
//! | `sql_selection` | [`SqlSelector`] | `selected_sql`, `selection_source`, `selection_rule` |
//!
//! Per-task failures (model calls, unparsable answers, SQL errors) are
//! recorded on the task's record; a processor only returns `Err` when a
//! record cannot be built at all.

pub mod sql_generation;
pub mod sql_refinement;
pub mod sql_selection;
pub mod table_extraction;

use std::sync::Arc;

use crate::error::LlmError;
use crate::pipeline::config::{DatasetPaths, EngineConfig};
use crate::pipeline::engine::StageSet;
use crate::sql::SqlExecutor;

pub use sql_generation::CandidateGenerator;
pub use sql_refinement::{SqlRefiner, TrackOutcome};
pub use sql_selection::{fallback_select, CandidateState, Choice, FallbackRule, SqlSelector};
pub use table_extraction::{normalize_tables, TableExtractor};

/// Error text recorded when a model call fails inside a stage.
pub(crate) fn model_call_error(error: &LlmError) -> String {
    format!("Model call error: {}", error)
}

/// The four stages in pipeline order.
pub fn standard_stages(
    executor: Arc<dyn SqlExecutor>,
    paths: &DatasetPaths,
    config: &EngineConfig,
) -> StageSet {
    StageSet::new()
        .with_stage(Arc::new(TableExtractor::new(paths.clone())))
        .with_stage(Arc::new(CandidateGenerator::new()))
        .with_stage(Arc::new(SqlRefiner::new(
            executor.clone(),
            config.query_timeout,
            config.max_refine_attempts,
        )))
        .with_stage(Arc::new(SqlSelector::new(
            executor,
            config.query_timeout,
            config.evidence_row_limit,
        )))
}
