pub mod openai;

use crate::domain::error::Result;
use async_trait::async_trait;

/// One chat-completion call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    /// Ask the endpoint for a JSON-object response. Implementations retry
    /// without the hint when the endpoint rejects it.
    pub json_object: bool,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embeds the texts in one batch, preserving order.
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
