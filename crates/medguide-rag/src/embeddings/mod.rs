pub mod cache;
pub mod hashing;
pub mod remote;

pub use cache::CachedEmbedder;
pub use hashing::HashingEmbedder;
pub use remote::RemoteEmbedder;

use anyhow::Result;
use async_trait::async_trait;

/// Unified embedding model trait
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a search query
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a guideline chunk
    async fn embed_document(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch embed chunks for ingestion
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_document(text).await?);
        }
        Ok(out)
    }

    /// Embedding vector dimension
    fn dimension(&self) -> usize;
}
