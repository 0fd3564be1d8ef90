//! Schema-constrained LLM calls.
//!
//! Every AI-assisted decision in the pipeline (classification, thread
//! parsing, merging, extraction) is one call through [`LlmClient`]: a system
//! prompt, a user prompt and a response schema, with a hard deadline. The
//! callers own their prompts and fallbacks; this module owns the wire.
//!
//! Configuration:
//! - `LLM_ENABLED`: set to "false" to disable all calls (fallbacks apply)
//! - `LLM_API_URL`: chat-completions base URL
//! - `LLM_API_KEY`: bearer token (required when enabled)
//! - `LLM_MODEL`: model name
//! - `LLM_DEADLINE_MS`: per-call deadline (default 30000)

use std::time::Duration;

use reqwest::Client;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub enabled: bool,
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub deadline: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm disabled by configuration")]
    Disabled,
    #[error("llm api key not configured")]
    MissingApiKey,
    #[error("llm request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm deadline exceeded")]
    DeadlineExceeded,
    #[error("llm provider returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("llm response failed schema validation: {0}")]
    Schema(String),
}

pub struct LlmClient {
    config: LlmConfig,
    client: Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(config.deadline)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.api_key.is_some()
    }

    /// Make one schema-constrained call and deserialize the response.
    ///
    /// The response schema is derived from `T` and sent as a `json_schema`
    /// response-format constraint; whatever comes back is still validated
    /// locally by deserialization, so a provider that ignores the constraint
    /// surfaces as [`LlmError::Schema`] rather than bad data downstream.
    pub async fn call_structured<T>(
        &self,
        schema_name: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<T, LlmError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        if !self.config.enabled {
            return Err(LlmError::Disabled);
        }
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey)?;

        let url = format!(
            "{}/chat/completions",
            self.config.api_url.trim_end_matches('/')
        );
        let schema = serde_json::to_value(schema_for!(T))
            .map_err(|err| LlmError::Schema(err.to_string()))?;
        let request = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {"name": schema_name, "schema": schema},
            },
        });

        debug!("llm call '{}' via {}", schema_name, url);

        let exchange = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Api { status, body });
            }
            let completion: ChatCompletionResponse = response.json().await?;
            let content = completion
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.message.content)
                .unwrap_or_default();
            serde_json::from_str::<T>(&content)
                .map_err(|err| LlmError::Schema(err.to_string()))
        };

        match tokio::time::timeout(self.config.deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::DeadlineExceeded),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}
