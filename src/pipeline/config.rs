//! Pipeline configuration.
//!
//! This module provides:
//! - [`ModelConfig`] / [`ConfigurationRegistry`]: per-stage model settings,
//!   read-only once the engine is built
//! - [`EngineConfig`]: inference endpoint, execution bounds and refinement
//!   policy, with builder methods and environment overrides
//! - [`DatasetPaths`]: the path resolver for result stores, databases and
//!   schema description files

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::error::ConfigError;
use crate::sql::DEFAULT_QUERY_TIMEOUT;

/// Base model used by the default registry.
pub const DEFAULT_BASE_MODEL: &str = "Qwen/Qwen2.5-Coder-7B-Instruct";

/// Merge model used by the default registry for selection.
pub const DEFAULT_MERGE_MODEL: &str = "cycloneboy/CscSQL-Merge-Qwen2.5-Coder-7B-Instruct";

/// Default device placement.
pub const DEFAULT_DEVICE: &str = "cuda:1";

/// Maximum correction rounds per refinement track.
pub const DEFAULT_MAX_REFINE_ATTEMPTS: usize = 3;

/// Rows of execution evidence shown to the merge model per candidate.
pub const DEFAULT_EVIDENCE_ROW_LIMIT: usize = 10;

/// Kind of model a stage loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Chat-style causal text generation.
    #[default]
    Causal,
    /// Sequence classification returning a label.
    Classification,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Causal => write!(f, "causal"),
            ModelKind::Classification => write!(f, "classification"),
        }
    }
}

/// Model settings for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base model identifier.
    pub model_name: String,
    /// Adapter weights merged into the base model, if any.
    #[serde(default, alias = "adapter_path")]
    pub lora_path: Option<String>,
    /// Device placement, e.g. `cuda:1`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Sampling temperature; `0` means greedy decoding.
    #[serde(default)]
    pub temperature: f64,
    /// Nucleus sampling bound, only used when sampling.
    #[serde(default)]
    pub top_p: Option<f64>,
    /// Number of completions requested when `single` is false.
    #[serde(default = "default_samples")]
    pub n: u32,
    /// Return exactly one completion regardless of `n`.
    #[serde(default = "default_single")]
    pub single: bool,
    #[serde(default, rename = "model_type")]
    pub kind: ModelKind,
    /// Label count for classification models.
    #[serde(default)]
    pub num_labels: Option<u32>,
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_samples() -> u32 {
    1
}

fn default_single() -> bool {
    true
}

impl ModelConfig {
    /// Greedy single-sample causal model on the default device.
    pub fn causal(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            lora_path: None,
            device: default_device(),
            temperature: 0.0,
            top_p: None,
            n: 1,
            single: true,
            kind: ModelKind::Causal,
            num_labels: None,
        }
    }

    pub fn with_lora_path(mut self, path: impl Into<String>) -> Self {
        self.lora_path = Some(path.into());
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_kind(mut self, kind: ModelKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_sampling(mut self, temperature: f64, top_p: Option<f64>) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self
    }

    /// Adapter path, ignoring blank values.
    pub fn adapter(&self) -> Option<&str> {
        self.lora_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
    }

    /// Completions to request per call.
    pub fn samples(&self) -> u32 {
        if self.single {
            1
        } else {
            self.n.max(1)
        }
    }
}

/// Stage name → model configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationRegistry {
    stages: HashMap<String, ModelConfig>,
}

impl ConfigurationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default per-stage table: the coder base model with stage-specific
    /// adapters, and a dedicated merge model for selection.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_stage(
                "table_extraction",
                ModelConfig::causal(DEFAULT_BASE_MODEL)
                    .with_lora_path("./final_checkpoint/7b/table_extracter/qwen"),
            )
            .with_stage(
                "sql_generation",
                ModelConfig::causal(DEFAULT_BASE_MODEL)
                    .with_lora_path("./final_checkpoint/7b/sql_generator/qwen"),
            )
            .with_stage(
                "sql_refinement",
                ModelConfig::causal(DEFAULT_BASE_MODEL)
                    .with_lora_path("./final_checkpoint/7b/sql_refiner/qwen"),
            )
            .with_stage("sql_selection", ModelConfig::causal(DEFAULT_MERGE_MODEL))
    }

    /// Parses a registry from a JSON object keyed by stage name.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Loads a registry file. A file that does not parse is an error, never a
    /// silent fallback to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_stage(mut self, stage: impl Into<String>, config: ModelConfig) -> Self {
        self.stages.insert(stage.into(), config);
        self
    }

    /// Returns the configuration for `stage`.
    ///
    /// # Errors
    ///
    /// `ConfigError::MissingStage` when no entry exists.
    pub fn get(&self, stage: &str) -> Result<&ModelConfig, ConfigError> {
        self.stages
            .get(stage)
            .ok_or_else(|| ConfigError::MissingStage(stage.to_string()))
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Runtime settings shared by the engine, model loader and stages.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// OpenAI-compatible inference server base URL (including `/v1`).
    pub api_base: String,
    /// Optional bearer token for the inference server.
    pub api_key: Option<String>,
    /// Device placement → inference server base URL.
    pub device_endpoints: HashMap<String, String>,
    /// HTTP timeout for a single inference request.
    pub request_timeout: Duration,
    /// Generation length bound.
    pub max_new_tokens: u32,
    /// Wall-clock bound for a single SQL execution.
    pub query_timeout: Duration,
    /// Correction rounds per refinement track.
    pub max_refine_attempts: usize,
    /// Rows of evidence rendered per candidate for the merge prompt.
    pub evidence_row_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000/v1".to_string(),
            api_key: None,
            device_endpoints: HashMap::new(),
            request_timeout: Duration::from_secs(600),
            max_new_tokens: 2048,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            max_refine_attempts: DEFAULT_MAX_REFINE_ATTEMPTS,
            evidence_row_limit: DEFAULT_EVIDENCE_ROW_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SQLFORGE_API_BASE`: inference server base URL (default: http://localhost:8000/v1)
    /// - `SQLFORGE_API_KEY`: bearer token (optional)
    /// - `SQLFORGE_DEVICE_ENDPOINTS`: `device=url` pairs, comma-separated
    /// - `SQLFORGE_REQUEST_TIMEOUT_SECS`: inference request timeout (default: 600)
    /// - `SQLFORGE_MAX_NEW_TOKENS`: generation length bound (default: 2048)
    /// - `SQLFORGE_QUERY_TIMEOUT_SECS`: SQL execution bound (default: 300)
    /// - `SQLFORGE_MAX_REFINE_ATTEMPTS`: correction rounds (default: 3)
    /// - `SQLFORGE_EVIDENCE_ROW_LIMIT`: merge evidence rows (default: 10)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("SQLFORGE_API_BASE") {
            config.api_base = val;
        }

        if let Some(val) = lookup("SQLFORGE_API_KEY") {
            if !val.trim().is_empty() {
                config.api_key = Some(val);
            }
        }

        if let Some(val) = lookup("SQLFORGE_DEVICE_ENDPOINTS") {
            config.device_endpoints = parse_device_endpoints(&val)?;
        }

        if let Some(val) = lookup("SQLFORGE_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SQLFORGE_REQUEST_TIMEOUT_SECS")?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("SQLFORGE_MAX_NEW_TOKENS") {
            config.max_new_tokens = parse_env_value(&val, "SQLFORGE_MAX_NEW_TOKENS")?;
        }

        if let Some(val) = lookup("SQLFORGE_QUERY_TIMEOUT_SECS") {
            let secs: f64 = parse_env_value(&val, "SQLFORGE_QUERY_TIMEOUT_SECS")?;
            config.query_timeout =
                Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
                    key: "SQLFORGE_QUERY_TIMEOUT_SECS".to_string(),
                    message: format!("'{}' is not a usable number of seconds: {}", val, e),
                })?;
        }

        if let Some(val) = lookup("SQLFORGE_MAX_REFINE_ATTEMPTS") {
            config.max_refine_attempts = parse_env_value(&val, "SQLFORGE_MAX_REFINE_ATTEMPTS")?;
        }

        if let Some(val) = lookup("SQLFORGE_EVIDENCE_ROW_LIMIT") {
            config.evidence_row_limit = parse_env_value(&val, "SQLFORGE_EVIDENCE_ROW_LIMIT")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "api_base cannot be empty".to_string(),
            ));
        }

        if self.query_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "query_timeout must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_new_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_new_tokens must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Inference server for a device placement, falling back to `api_base`.
    pub fn endpoint_for(&self, device: &str) -> &str {
        self.device_endpoints
            .get(device)
            .map(String::as_str)
            .unwrap_or(&self.api_base)
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_device_endpoint(
        mut self,
        device: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        self.device_endpoints.insert(device.into(), endpoint.into());
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_max_refine_attempts(mut self, attempts: usize) -> Self {
        self.max_refine_attempts = attempts;
        self
    }

    pub fn with_evidence_row_limit(mut self, limit: usize) -> Self {
        self.evidence_row_limit = limit;
        self
    }

    pub fn with_max_new_tokens(mut self, tokens: u32) -> Self {
        self.max_new_tokens = tokens;
        self
    }
}

/// Parses a value from an environment variable string.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}': {}", val, e),
    })
}

fn parse_device_endpoints(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut endpoints = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (device, url) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: "SQLFORGE_DEVICE_ENDPOINTS".to_string(),
            message: format!("expected device=url, got '{}'", pair),
        })?;
        endpoints.insert(device.trim().to_string(), url.trim().to_string());
    }
    Ok(endpoints)
}

/// Resolves every on-disk location the pipeline touches.
#[derive(Debug, Clone)]
pub struct DatasetPaths {
    pub output_base_dir: PathBuf,
    pub dataset_name: String,
    pub db_root_dir: PathBuf,
    pub db_schema_dir: PathBuf,
}

impl DatasetPaths {
    pub fn new(
        output_base_dir: impl Into<PathBuf>,
        dataset_name: impl Into<String>,
        db_root_dir: impl Into<PathBuf>,
        db_schema_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            output_base_dir: output_base_dir.into(),
            dataset_name: dataset_name.into(),
            db_root_dir: db_root_dir.into(),
            db_schema_dir: db_schema_dir.into(),
        }
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.output_base_dir.join(&self.dataset_name)
    }

    pub fn intermediate_results_dir(&self) -> PathBuf {
        self.dataset_dir().join("intermediate_results")
    }

    /// Persisted partial-result file for a stage.
    pub fn stage_results_path(&self, stage: &str) -> PathBuf {
        self.intermediate_results_dir()
            .join(format!("{}_results.jsonl", stage))
    }

    /// Final merged output of a run.
    pub fn pipeline_results_path(&self) -> PathBuf {
        self.dataset_dir().join("pipeline_results.jsonl")
    }

    pub fn sql_results_dir(&self) -> PathBuf {
        self.dataset_dir().join("sql_results")
    }

    pub fn table_results_dir(&self) -> PathBuf {
        self.dataset_dir().join("table_results")
    }

    pub fn db_path(&self, db_id: &str) -> PathBuf {
        self.db_root_dir.join(db_id).join(format!("{}.sqlite", db_id))
    }

    /// Schema description file for a database.
    pub fn schema_file(&self, db_id: &str) -> PathBuf {
        self.db_schema_dir.join(format!("{}_schema.json", db_id))
    }
}
