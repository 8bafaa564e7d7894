//! HTTP client for an OpenAI-compatible inference server.
//!
//! Covers the four endpoints the pipeline uses:
//! - `POST {base}/chat/completions` for causal generation
//! - `POST {base}/classify` for sequence classification
//! - `POST {base}/load_lora_adapter` and `POST {base}/unload_lora_adapter`
//!   for per-stage adapter weights

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::resource::Message;
use crate::error::LlmError;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff in milliseconds.
const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Request for chat-style generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Number of completions to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
            n: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_n(mut self, n: u32) -> Self {
        self.n = Some(n);
        self
    }
}

/// Response from a chat generation request.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl GenerationResponse {
    /// Completion texts in choice order; null content becomes "".
    pub fn contents(self) -> Vec<String> {
        let mut choices = self.choices;
        choices.sort_by_key(|c| c.index);
        choices
            .into_iter()
            .map(|c| c.message.content.unwrap_or_default())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Token usage statistics for a generation request.
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    data: Vec<ClassifyData>,
}

#[derive(Debug, Deserialize)]
struct ClassifyData {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    probs: Vec<f64>,
}

impl ClassifyData {
    /// Label name, or the argmax index when the server sends no names.
    fn into_label(self) -> String {
        if let Some(label) = self.label {
            return label;
        }
        self.probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index.to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
struct AdapterRequest<'a> {
    lora_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    lora_path: Option<&'a str>,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Client for one inference server.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    api_base: String,
    api_key: Option<String>,
    http_client: Client,
}

impl InferenceClient {
    /// Creates a client for `api_base` (e.g. "http://localhost:8000/v1").
    ///
    /// # Errors
    ///
    /// `LlmError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Runs a chat completion request with retry on transient failures.
    pub async fn chat(&self, request: &GenerationRequest) -> Result<GenerationResponse, LlmError> {
        self.post_with_retry("chat/completions", request).await
    }

    /// Classifies each input, returning one label per input.
    pub async fn classify(&self, model: &str, input: Vec<String>) -> Result<Vec<String>, LlmError> {
        let response: ClassifyResponse = self
            .post_with_retry("classify", &ClassifyRequest { model, input })
            .await?;
        Ok(response.data.into_iter().map(ClassifyData::into_label).collect())
    }

    /// Registers adapter weights under `name`.
    pub async fn load_lora_adapter(&self, name: &str, path: &str) -> Result<(), LlmError> {
        let request = AdapterRequest {
            lora_name: name,
            lora_path: Some(path),
        };
        self.post_for_status("load_lora_adapter", &request).await
    }

    /// Removes adapter weights registered under `name`.
    pub async fn unload_lora_adapter(&self, name: &str) -> Result<(), LlmError> {
        let request = AdapterRequest {
            lora_name: name,
            lora_path: None,
        };
        self.post_for_status("unload_lora_adapter", &request).await
    }

    async fn post_with_retry<B, R>(&self, endpoint: &str, body: &B) -> Result<R, LlmError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // 1s, 2s
                let delay_ms = BASE_RETRY_DELAY_MS * (1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay_ms,
                    endpoint = endpoint,
                    "Retrying inference request after transient failure"
                );
            }

            match self.post_once(endpoint, body).await {
                Ok(text) => {
                    return serde_json::from_str(&text).map_err(|e| {
                        LlmError::ParseError(format!(
                            "Failed to parse {} response: {}",
                            endpoint, e
                        ))
                    })
                }
                Err(err) if is_transient_error(&err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        endpoint = endpoint,
                        error = %err,
                        "Transient error, will retry"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LlmError::RequestFailed("Max retries exceeded with no error captured".to_string())
        }))
    }

    async fn post_for_status<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<(), LlmError> {
        self.post_once(endpoint, body).await.map(|_| ())
    }

    /// Single request, returning the success body text.
    async fn post_once<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<String, LlmError> {
        let url = format!("{}/{}", self.api_base, endpoint);

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        let text = http_response
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|r| r.error.message)
                .unwrap_or(text);
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        Ok(text)
    }
}

/// Whether a failed request is worth retrying.
fn is_transient_error(error: &LlmError) -> bool {
    match error {
        LlmError::RequestFailed(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("connection")
                || msg.contains("temporarily")
        }
        LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
        _ => false,
    }
}
