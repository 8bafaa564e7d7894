//! sqlforge: staged, resumable text-to-SQL batch pipeline.
//!
//! Questions flow through table extraction, candidate generation,
//! execution-guided refinement and selection. Each stage persists its
//! results so an interrupted batch resumes where it stopped.

pub mod cli;
pub mod error;
pub mod export;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod schema;
pub mod sql;
pub mod stages;
pub mod utils;

// Re-export commonly used error types
pub use error::{ConfigError, LlmError, StageError, StoreError};
