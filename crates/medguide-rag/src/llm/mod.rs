//! LLM Module - completion-service contract and external API providers

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SynthesisConfig;

pub mod external;

pub use external::ExternalProvider;

/// External API providers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ApiProvider {
    OpenAI,
    Anthropic,
    OpenRouter,
    Together,
    Ollama,
    Custom { endpoint: String },
}

/// Core trait for completion providers.
///
/// Implementations report classified failures by returning a
/// [`ServiceError`](crate::error::ServiceError) inside the error.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Generate a completion
    async fn complete(&self, prompt: &str, config: &GenerationConfig) -> Result<String>;

    /// Short provider name used in logs
    fn name(&self) -> &str {
        "completion"
    }
}

/// Generation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.1,
            top_p: 0.95,
            stop_sequences: vec![],
            seed: None,
        }
    }
}

impl From<&SynthesisConfig> for GenerationConfig {
    fn from(config: &SynthesisConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            ..Self::default()
        }
    }
}

impl GenerationConfig {
    /// Short, near-deterministic generation used for one-word classification.
    pub fn for_classification() -> Self {
        Self {
            max_tokens: 8,
            temperature: 0.0,
            top_p: 1.0,
            stop_sequences: vec!["\n".to_string()],
            seed: Some(0),
        }
    }
}
