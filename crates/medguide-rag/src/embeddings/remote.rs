//! HTTP client for OpenAI-compatible `/embeddings` endpoints.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::EmbeddingModel;
use crate::error::ServiceError;
use crate::llm::external::parse_json_body;

pub struct RemoteEmbedder {
    endpoint: String,
    api_key: String,
    model: String,
    dimension: usize,
    client: Client,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(endpoint: String, api_key: String, model: String, dimension: usize) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        tracing::info!(endpoint = %endpoint, model = %model, dimension, "Creating RemoteEmbedder");

        Ok(Self {
            endpoint,
            api_key,
            model,
            dimension,
            client,
        })
    }

    /// OpenAI `text-embedding-3-small` at its native dimension.
    pub fn openai(api_key: String) -> Result<Self> {
        Self::new(
            "https://api.openai.com/v1/embeddings".to_string(),
            api_key,
            "text-embedding-3-small".to_string(),
            1536,
        )
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut builder = self.client.post(&self.endpoint).json(&EmbedRequest {
            model: &self.model,
            input,
        });
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Timeout(format!("embedding request to {} timed out", self.endpoint))
            } else {
                ServiceError::Unavailable(format!("embedding request to {} failed: {}", self.endpoint, e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::Unavailable(format!("failed to read embedding response: {}", e)))?;
        if !status.is_success() {
            tracing::error!(endpoint = %self.endpoint, status = %status, "Embedding API returned error");
            return Err(ServiceError::from_http_status(status, &body).into());
        }

        let parsed: EmbedResponse = parse_json_body(&body, &self.endpoint)?;
        decode_embeddings(parsed, input.len(), self.dimension).map_err(Into::into)
    }
}

/// Order embeddings by their `index` and check the count and dimension.
fn decode_embeddings(response: EmbedResponse, expected: usize, dimension: usize) -> Result<Vec<Vec<f32>>, ServiceError> {
    let mut data = response.data;
    if data.len() != expected {
        return Err(ServiceError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));

    data.into_iter()
        .map(|d| {
            if d.embedding.len() != dimension {
                Err(ServiceError::InvalidResponse(format!(
                    "embedding has dimension {}, expected {}",
                    d.embedding.len(),
                    dimension
                )))
            } else {
                Ok(d.embedding)
            }
        })
        .collect()
}

#[async_trait]
impl EmbeddingModel for RemoteEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.request(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| ServiceError::InvalidResponse("empty embedding response".into()).into())
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_query(text).await
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
