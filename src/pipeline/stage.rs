//! Stage identity and the stage-processor seam.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::task::{StageRecord, Task};
use crate::error::StageError;
use crate::llm::ModelResource;

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    TableExtraction,
    SqlGeneration,
    SqlRefinement,
    SqlSelection,
}

impl StageName {
    /// All stages in execution order.
    pub const ALL: [StageName; 4] = [
        StageName::TableExtraction,
        StageName::SqlGeneration,
        StageName::SqlRefinement,
        StageName::SqlSelection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::TableExtraction => "table_extraction",
            StageName::SqlGeneration => "sql_generation",
            StageName::SqlRefinement => "sql_refinement",
            StageName::SqlSelection => "sql_selection",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// One pipeline step: a function from pending tasks and a borrowed model to
/// partial results.
///
/// Implementations hold no persistent state and may be invoked on any subset
/// of tasks. Per-task failures belong in the returned records; an `Err`
/// aborts the whole run.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Stage name, used for the registry lookup and the result store.
    fn name(&self) -> &str;

    /// Processes `tasks` (merged views) and returns one record per task.
    async fn process(
        &self,
        tasks: &[Task],
        model: &dyn ModelResource,
    ) -> Result<Vec<StageRecord>, StageError>;
}

/// Runs a stage call with uniform start/success/failure telemetry.
pub async fn run_instrumented<F>(
    stage: &str,
    task_count: usize,
    call: F,
) -> Result<Vec<StageRecord>, StageError>
where
    F: Future<Output = Result<Vec<StageRecord>, StageError>>,
{
    info!(stage = stage, tasks = task_count, "Stage started");
    let start = Instant::now();

    let result = call.await;
    let elapsed_secs = start.elapsed().as_secs_f64();

    match &result {
        Ok(records) => info!(
            stage = stage,
            records = records.len(),
            elapsed_secs = elapsed_secs,
            "Stage completed"
        ),
        Err(e) => error!(
            stage = stage,
            error = %e,
            elapsed_secs = elapsed_secs,
            "Stage failed"
        ),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_name_roundtrip() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>(), Ok(stage));
            assert_eq!(stage.to_string(), stage.as_str());
        }
        assert!("sql_merge".parse::<StageName>().is_err());
    }

    #[test]
    fn test_stage_order() {
        let names: Vec<&str> = StageName::ALL.iter().map(StageName::as_str).collect();
        assert_eq!(
            names,
            vec!["table_extraction", "sql_generation", "sql_refinement", "sql_selection"]
        );
    }

    #[tokio::test]
    async fn test_run_instrumented_passes_result_through() {
        let ok = run_instrumented("sql_generation", 1, async {
            Ok(vec![StageRecord::new(1).with_field("candidate_sql_1", "SELECT 1")])
        })
        .await
        .expect("ok");
        assert_eq!(ok.len(), 1);

        let err = run_instrumented("sql_generation", 1, async {
            Err(StageError::InvalidInput("boom".to_string()))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
