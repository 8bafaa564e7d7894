//! Error types for sqlforge operations.
//!
//! Defines the error types shared by the pipeline subsystems:
//! - Configuration registry and engine settings
//! - Model inference backend calls
//! - Persisted partial-result stores
//! - Stage processor batch calls
//!
//! SQL execution outcomes and answer-extraction failures are deliberately not
//! part of this module: they are values recorded on a task's partial result,
//! see [`crate::sql::SqlFailure`] and
//! [`crate::utils::answer_extraction::ExtractionError`].

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No model configuration registered for stage '{0}'")]
    MissingStage(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during model inference operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse model response: {0}")]
    ParseError(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Model for stage '{0}' has already been released")]
    Released(String),

    #[error("Operation not supported by {kind} model: {operation}")]
    Unsupported { kind: String, operation: String },

    #[error("Failed to load model '{model}': {message}")]
    LoadFailed { model: String, message: String },
}

/// Errors that can occur while reading or writing persisted stage results.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to replace '{path}': {message}")]
    Persist { path: PathBuf, message: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that escape a stage processor's batch call.
///
/// Per-task failures never surface here; they are recorded on the task's
/// partial result. A `StageError` aborts the whole run.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Model error: {0}")]
    Model(#[from] LlmError),

    #[error("Invalid stage input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
