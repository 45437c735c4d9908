use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::EmbeddingModel;

#[derive(Debug, Clone, Copy)]
enum EmbedMode {
    Query,
    Document,
}

/// LRU cache in front of any embedding model. Query and document embeddings
/// of the same text are cached separately.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingModel>,
    cache: Arc<RwLock<lru::LruCache<String, Vec<f32>>>>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingModel>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Arc::new(RwLock::new(lru::LruCache::new(capacity))),
        }
    }

    fn cache_key(mode: EmbedMode, text: &str) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        format!("{:?}:{:x}:{}", mode, hasher.finish(), text.len())
    }

    async fn embed_cached(&self, mode: EmbedMode, text: &str) -> Result<Vec<f32>> {
        let key = Self::cache_key(mode, text);
        if let Some(cached) = self.cache.write().get(&key) {
            return Ok(cached.clone());
        }

        let embedding = match mode {
            EmbedMode::Query => self.inner.embed_query(text).await?,
            EmbedMode::Document => self.inner.embed_document(text).await?,
        };
        self.cache.write().put(key, embedding.clone());
        Ok(embedding)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

#[async_trait]
impl EmbeddingModel for CachedEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_cached(EmbedMode::Query, text).await
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_cached(EmbedMode::Document, text).await
    }

    /// Unchanged chunks of a re-ingested guideline come from the cache; the
    /// misses go to the inner model as one batch.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts
            .iter()
            .map(|text| Self::cache_key(EmbedMode::Document, text))
            .collect();
        let mut embeddings: Vec<Option<Vec<f32>>> = {
            let mut cache = self.cache.write();
            keys.iter().map(|key| cache.get(key).cloned()).collect()
        };

        let misses: Vec<usize> = (0..texts.len()).filter(|&i| embeddings[i].is_none()).collect();
        if !misses.is_empty() {
            let batch: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let embedded = self.inner.embed_documents(&batch).await?;
            if embedded.len() != batch.len() {
                return Err(anyhow!("expected {} embeddings, got {}", batch.len(), embedded.len()));
            }

            let mut cache = self.cache.write();
            for (i, embedding) in misses.into_iter().zip(embedded) {
                cache.put(keys[i].clone(), embedding.clone());
                embeddings[i] = Some(embedding);
            }
        }

        Ok(embeddings.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}
