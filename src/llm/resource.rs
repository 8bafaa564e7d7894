//! Model resource capability.
//!
//! A stage borrows exactly one [`ModelResource`] for the duration of one
//! batch call. The engine obtains it from a [`ModelLoader`] and always calls
//! [`ModelResource::release`] afterwards, including when the batch fails.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::pipeline::config::ModelConfig;

/// A message in a conversation with a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender ("system" or "user").
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Input to a model call: plain text or a role-tagged message sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Text(String),
    Messages(Vec<Message>),
}

impl Prompt {
    /// Message form; plain text becomes a single user message.
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Prompt::Text(text) => vec![Message::user(text)],
            Prompt::Messages(messages) => messages,
        }
    }

    /// Flat text form; message contents are joined by blank lines.
    pub fn into_text(self) -> String {
        match self {
            Prompt::Text(text) => text,
            Prompt::Messages(messages) => messages
                .into_iter()
                .map(|m| m.content)
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<Vec<Message>> for Prompt {
    fn from(messages: Vec<Message>) -> Self {
        Prompt::Messages(messages)
    }
}

/// A loaded model bound to one stage's configuration.
#[async_trait]
pub trait ModelResource: Send + Sync {
    /// Stage this resource was loaded for.
    fn stage(&self) -> &str;

    /// Produces one or more completions for `prompt`.
    ///
    /// # Errors
    ///
    /// `LlmError::Released` once [`release`](Self::release) has run, or the
    /// backend's error.
    async fn produce(&self, prompt: Prompt) -> Result<Vec<String>, LlmError>;

    /// Produces exactly one completion.
    async fn produce_one(&self, prompt: Prompt) -> Result<String, LlmError> {
        self.produce(prompt)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ParseError("model returned no completions".to_string()))
    }

    /// Frees the resource. Calling it more than once is a no-op.
    async fn release(&mut self);
}

/// Acquires a [`ModelResource`] for a stage.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(
        &self,
        stage: &str,
        config: &ModelConfig,
    ) -> Result<Box<dyn ModelResource>, LlmError>;
}
