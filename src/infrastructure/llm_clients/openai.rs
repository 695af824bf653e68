use super::{ChatClient, ChatRequest, EmbeddingClient};
use crate::domain::error::{AppError, Result};
use crate::infrastructure::config::Settings;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub struct OpenAIClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_timeout: Duration,
    embedding_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAIClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            chat_timeout: Duration::from_secs(60),
            embedding_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: settings.openai_api_key.clone(),
            base_url: settings.openai_base_url.clone(),
            chat_timeout: Duration::from_secs(settings.llm_timeout_secs),
            embedding_timeout: Duration::from_secs(settings.embedding_timeout_secs),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        if self.base_url.ends_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn post_chat(&self, request: &ChatRequest, json_object: bool) -> Result<reqwest::Response> {
        let mut body = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user}
            ],
            "temperature": request.temperature,
        });
        if json_object {
            body["response_format"] = json!({"type": "json_object"});
        }

        self.client
            .post(self.endpoint("chat/completions"))
            .timeout(self.chat_timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LLMError(format!("Request failed: {}", e)))
    }
}

#[async_trait]
impl ChatClient for OpenAIClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let mut response = self.post_chat(request, request.json_object).await?;

        // Some endpoints reject the response-format hint; retry without it.
        if !response.status().is_success() && request.json_object {
            response = self.post_chat(request, false).await?;
        }

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::LLMError(format!(
                "API error ({}): {}",
                status, text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::LLMError(format!("Failed to parse JSON: {}", e)))?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::LLMError("Invalid response format".to_string()))
    }
}

#[async_trait]
impl EmbeddingClient for OpenAIClient {
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.api_key.is_empty() {
            return Err(AppError::ConfigError(
                "An API key is required for embeddings".to_string(),
            ));
        }

        let body = json!({"model": model, "input": texts});
        let response = self
            .client
            .post(self.endpoint("embeddings"))
            .timeout(self.embedding_timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LLMError(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::LLMError(format!(
                "Embedding API error ({}): {}",
                status, text
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AppError::LLMError(format!("Failed to parse embedding response: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(AppError::LLMError(format!(
                "Embedding count mismatch: requested {}, received {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
