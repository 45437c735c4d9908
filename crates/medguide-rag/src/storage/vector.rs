use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{SearchHit, VectorEntry, VectorIndex, VectorSnapshot};
use crate::error::ServiceError;

/// Brute-force cosine index held in memory.
///
/// Queries scan an immutable snapshot; `publish` swaps in a new one built from
/// the staged entries.
pub struct MemoryVectorIndex {
    dimension: usize,
    published: RwLock<Arc<Vec<VectorEntry>>>,
    staged: Mutex<BTreeMap<String, VectorEntry>>,
}

impl MemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            published: RwLock::new(Arc::new(Vec::new())),
            staged: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

fn check_dimension(expected: usize, len: usize) -> Result<(), ServiceError> {
    if len != expected {
        return Err(ServiceError::Rejected(format!(
            "vector has dimension {}, index expects {}",
            len, expected
        )));
    }
    Ok(())
}

/// Entries of one publication of a [`MemoryVectorIndex`].
pub struct PublishedVectors {
    dimension: usize,
    entries: Arc<Vec<VectorEntry>>,
}

#[async_trait]
impl VectorSnapshot for PublishedVectors {
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_dimension(self.dimension, vector.len())?;

        let mut hits: Vec<SearchHit> = self
            .entries
            .par_iter()
            .map(|entry| SearchHit {
                chunk_id: entry.chunk_id.clone(),
                score: cosine_similarity(vector, &entry.vector),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
        hits.truncate(k);
        Ok(hits)
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    fn snapshot(&self) -> Arc<dyn VectorSnapshot> {
        Arc::new(PublishedVectors {
            dimension: self.dimension,
            entries: self.published.read().clone(),
        })
    }

    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        check_dimension(self.dimension, entry.vector.len())?;
        self.staged.lock().insert(entry.chunk_id.clone(), entry);
        Ok(())
    }

    async fn remove_document(&self, document_id: &str) -> Result<()> {
        self.staged.lock().retain(|_, entry| entry.document_id != document_id);
        Ok(())
    }

    async fn publish(&self) -> Result<()> {
        let next: Vec<VectorEntry> = self.staged.lock().values().cloned().collect();
        let count = next.len();
        *self.published.write() = Arc::new(next);
        tracing::debug!(entries = count, "Published vector index snapshot");
        Ok(())
    }

    async fn discard(&self) -> Result<()> {
        let published = self.published.read().clone();
        *self.staged.lock() = published.iter().map(|e| (e.chunk_id.clone(), e.clone())).collect();
        Ok(())
    }

    fn len(&self) -> usize {
        self.published.read().len()
    }
}
