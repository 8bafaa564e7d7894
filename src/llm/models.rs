//! Model resources backed by an inference server.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::client::{GenerationRequest, InferenceClient};
use super::resource::{ModelLoader, ModelResource, Prompt};
use crate::error::LlmError;
use crate::pipeline::config::{EngineConfig, ModelConfig, ModelKind};

/// An adapter registered on the server for the lifetime of a resource.
#[derive(Debug)]
struct Adapter {
    name: String,
    loaded: bool,
}

impl Adapter {
    async fn load(
        client: &InferenceClient,
        stage: &str,
        config: &ModelConfig,
    ) -> Result<Option<Self>, LlmError> {
        let Some(path) = config.adapter() else {
            return Ok(None);
        };
        let name = format!("sqlforge-{}", stage);
        client
            .load_lora_adapter(&name, path)
            .await
            .map_err(|e| LlmError::LoadFailed {
                model: format!("{} + {}", config.model_name, path),
                message: e.to_string(),
            })?;
        info!(stage = stage, adapter = %name, path = path, "Loaded adapter");
        Ok(Some(Self { name, loaded: true }))
    }

    async fn unload(&mut self, client: &InferenceClient) {
        if !self.loaded {
            return;
        }
        self.loaded = false;
        if let Err(e) = client.unload_lora_adapter(&self.name).await {
            warn!(adapter = %self.name, error = %e, "Failed to unload adapter");
        }
    }
}

/// Chat-style generation model.
#[derive(Debug)]
pub struct CausalModel {
    client: Arc<InferenceClient>,
    stage: String,
    config: ModelConfig,
    adapter: Option<Adapter>,
    max_new_tokens: u32,
    released: bool,
}

impl CausalModel {
    /// Loads the model, registering its adapter when one is configured.
    pub async fn load(
        client: Arc<InferenceClient>,
        stage: &str,
        config: &ModelConfig,
        max_new_tokens: u32,
    ) -> Result<Self, LlmError> {
        let adapter = Adapter::load(&client, stage, config).await?;
        Ok(Self {
            client,
            stage: stage.to_string(),
            config: config.clone(),
            adapter,
            max_new_tokens,
            released: false,
        })
    }

    /// Model name sent with each request: the adapter when one is loaded.
    pub fn served_model(&self) -> &str {
        match &self.adapter {
            Some(adapter) => &adapter.name,
            None => &self.config.model_name,
        }
    }

    fn build_request(&self, prompt: Prompt) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.served_model(), prompt.into_messages())
            .with_max_tokens(self.max_new_tokens)
            .with_n(self.config.samples());

        if self.config.temperature > 0.0 {
            request = request.with_temperature(self.config.temperature);
            if let Some(top_p) = self.config.top_p {
                request = request.with_top_p(top_p);
            }
        } else {
            request = request.with_temperature(0.0);
        }
        request
    }
}

#[async_trait]
impl ModelResource for CausalModel {
    fn stage(&self) -> &str {
        &self.stage
    }

    async fn produce(&self, prompt: Prompt) -> Result<Vec<String>, LlmError> {
        if self.released {
            return Err(LlmError::Released(self.stage.clone()));
        }
        let request = self.build_request(prompt);
        let response = self.client.chat(&request).await?;
        let mut contents = response.contents();
        if self.config.single {
            contents.truncate(1);
        }
        debug!(stage = %self.stage, completions = contents.len(), "Model call complete");
        Ok(contents)
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.unload(&self.client).await;
        }
        info!(stage = %self.stage, model = %self.config.model_name, "Released model");
    }
}

/// Sequence classification model; each call yields one label.
#[derive(Debug)]
pub struct ClassificationModel {
    client: Arc<InferenceClient>,
    stage: String,
    config: ModelConfig,
    adapter: Option<Adapter>,
    released: bool,
}

impl ClassificationModel {
    pub async fn load(
        client: Arc<InferenceClient>,
        stage: &str,
        config: &ModelConfig,
    ) -> Result<Self, LlmError> {
        let adapter = Adapter::load(&client, stage, config).await?;
        Ok(Self {
            client,
            stage: stage.to_string(),
            config: config.clone(),
            adapter,
            released: false,
        })
    }
}

#[async_trait]
impl ModelResource for ClassificationModel {
    fn stage(&self) -> &str {
        &self.stage
    }

    async fn produce(&self, prompt: Prompt) -> Result<Vec<String>, LlmError> {
        if self.released {
            return Err(LlmError::Released(self.stage.clone()));
        }
        let model = match &self.adapter {
            Some(adapter) => adapter.name.as_str(),
            None => self.config.model_name.as_str(),
        };
        let labels = self.client.classify(model, vec![prompt.into_text()]).await?;
        if labels.is_empty() {
            return Err(LlmError::ParseError(
                "classification returned no labels".to_string(),
            ));
        }
        Ok(labels)
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.unload(&self.client).await;
        }
        info!(stage = %self.stage, model = %self.config.model_name, "Released model");
    }
}

/// Loads models against the inference server mapped to each device.
#[derive(Debug, Clone)]
pub struct HttpModelLoader {
    engine: EngineConfig,
}

impl HttpModelLoader {
    pub fn new(engine: EngineConfig) -> Self {
        Self { engine }
    }

    fn client_for(&self, device: &str) -> Result<Arc<InferenceClient>, LlmError> {
        let client = InferenceClient::new(
            self.engine.endpoint_for(device),
            self.engine.api_key.clone(),
            self.engine.request_timeout,
        )?;
        Ok(Arc::new(client))
    }
}

#[async_trait]
impl ModelLoader for HttpModelLoader {
    async fn load(
        &self,
        stage: &str,
        config: &ModelConfig,
    ) -> Result<Box<dyn ModelResource>, LlmError> {
        let client = self.client_for(&config.device)?;
        info!(
            stage = stage,
            model = %config.model_name,
            kind = %config.kind,
            device = %config.device,
            endpoint = client.api_base(),
            "Loading model"
        );
        match config.kind {
            ModelKind::Causal => Ok(Box::new(
                CausalModel::load(client, stage, config, self.engine.max_new_tokens).await?,
            )),
            ModelKind::Classification => {
                Ok(Box::new(ClassificationModel::load(client, stage, config).await?))
            }
        }
    }
}

impl Default for HttpModelLoader {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
