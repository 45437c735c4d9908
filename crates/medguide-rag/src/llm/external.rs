//! External completion provider for OpenAI-compatible and Anthropic APIs.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{ApiProvider, CompletionProvider, GenerationConfig};
use crate::error::ServiceError;

/// External API provider
pub struct ExternalProvider {
    provider: ApiProvider,
    api_key: String,
    model: String,
    client: Client,
}

impl ExternalProvider {
    pub fn new(provider: ApiProvider, api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(120))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        tracing::info!(
            provider = ?provider,
            model = %model,
            "Creating ExternalProvider (connect_timeout=15s)"
        );

        Ok(Self {
            provider,
            api_key,
            model,
            client,
        })
    }

    fn get_endpoint(&self) -> String {
        match &self.provider {
            ApiProvider::OpenAI => "https://api.openai.com/v1/chat/completions".to_string(),
            ApiProvider::Anthropic => "https://api.anthropic.com/v1/messages".to_string(),
            ApiProvider::OpenRouter => "https://openrouter.ai/api/v1/chat/completions".to_string(),
            ApiProvider::Together => "https://api.together.xyz/v1/chat/completions".to_string(),
            ApiProvider::Ollama => "http://localhost:11434/v1/chat/completions".to_string(),
            ApiProvider::Custom { endpoint } => endpoint.clone(),
        }
    }

    fn build_request(&self, prompt: &str, config: &GenerationConfig) -> serde_json::Value {
        let mut request = match self.provider {
            ApiProvider::Anthropic => json!({
                "model": self.model,
                "messages": [
                    {"role": "user", "content": prompt}
                ],
                "max_tokens": config.max_tokens,
                "temperature": config.temperature,
                "top_p": config.top_p
            }),
            _ => json!({
                "model": self.model,
                "messages": [
                    {"role": "user", "content": prompt}
                ],
                "max_tokens": config.max_tokens,
                "temperature": config.temperature,
                "top_p": config.top_p,
                "stream": false
            }),
        };

        if !config.stop_sequences.is_empty() {
            let key = match self.provider {
                ApiProvider::Anthropic => "stop_sequences",
                _ => "stop",
            };
            request[key] = json!(config.stop_sequences);
        }
        // Anthropic has no seed parameter
        match (config.seed, &self.provider) {
            (Some(seed), ApiProvider::Anthropic) => {
                tracing::debug!(seed, "Ignoring seed for Anthropic request");
            }
            (Some(seed), _) => request["seed"] = json!(seed),
            (None, _) => {}
        }
        request
    }

    async fn send(&self, endpoint: &str, request: &serde_json::Value) -> Result<String> {
        let builder = self.client.post(endpoint).json(request);
        let builder = match self.provider {
            ApiProvider::Anthropic => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01"),
            _ if self.api_key.is_empty() => builder,
            _ => builder.header("Authorization", format!("Bearer {}", self.api_key)),
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                tracing::error!(endpoint = %endpoint, "Request timed out (connect or response timeout)");
                ServiceError::Timeout(format!("request to {} timed out", endpoint))
            } else if e.is_connect() {
                tracing::error!(endpoint = %endpoint, error = %e, "Connection failed");
                ServiceError::Unavailable(format!("failed to connect to {}: {}", endpoint, e))
            } else {
                tracing::error!(endpoint = %endpoint, error = %e, "Request failed");
                ServiceError::Unavailable(format!("request to {} failed: {}", endpoint, e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::Unavailable(format!("failed to read response body from {}: {}", endpoint, e)))?;

        if !status.is_success() {
            tracing::error!(endpoint = %endpoint, status = %status, "API returned error");
            return Err(ServiceError::from_http_status(status, &body).into());
        }
        Ok(body)
    }
}

#[async_trait]
impl CompletionProvider for ExternalProvider {
    async fn complete(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        let endpoint = self.get_endpoint();
        tracing::debug!(
            endpoint = %endpoint,
            model = %self.model,
            max_tokens = config.max_tokens,
            prompt_len = prompt.len(),
            "Sending completion request"
        );

        let request = self.build_request(prompt, config);
        let body = self.send(&endpoint, &request).await?;

        let text = match self.provider {
            ApiProvider::Anthropic => {
                let result: AnthropicResponse = parse_json_body(&body, &endpoint)?;
                result
                    .content
                    .into_iter()
                    .next()
                    .map(|c| c.text)
                    .ok_or_else(|| ServiceError::InvalidResponse("no content returned from Anthropic API".into()))?
            }
            _ => {
                let result: OpenAIResponse = parse_json_body(&body, &endpoint)?;
                result
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| ServiceError::InvalidResponse("no choices returned from API".into()))?
            }
        };

        tracing::debug!("API response received, {} chars", text.len());
        Ok(text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Parse a response body as JSON, returning a clear error if the server returned HTML
/// (e.g. a gateway error page) instead of valid JSON.
pub(crate) fn parse_json_body<T: serde::de::DeserializeOwned>(body: &str, endpoint: &str) -> Result<T, ServiceError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        let preview: String = trimmed.chars().take(200).collect();
        return Err(ServiceError::Unavailable(format!(
            "endpoint {} returned HTML instead of JSON: {}",
            endpoint, preview
        )));
    }

    serde_json::from_str::<T>(body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        ServiceError::InvalidResponse(format!(
            "failed to parse JSON from {}: {}. Response body: {}",
            endpoint, e, preview
        ))
    })
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: String,
}
