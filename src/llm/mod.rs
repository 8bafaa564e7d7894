//! Model inference layer.
//!
//! - [`ModelResource`] / [`ModelLoader`]: the capability a stage borrows for
//!   one batch call and the factory that acquires it
//! - [`CausalModel`] / [`ClassificationModel`]: resources backed by an
//!   OpenAI-compatible inference server
//! - [`HttpModelLoader`]: resolves a stage's device to a server and loads
//!   the configured model kind

pub mod client;
pub mod models;
pub mod resource;

pub use client::{GenerationRequest, GenerationResponse, InferenceClient};
pub use models::{CausalModel, ClassificationModel, HttpModelLoader};
pub use resource::{Message, ModelLoader, ModelResource, Prompt};
