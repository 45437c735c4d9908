//! Index and document-store contracts used by retrieval and ingestion.
//!
//! Every store stages ingestion writes and exposes them only on `publish`.
//! Queries read through a [`ReadView`]: snapshots of all three stores taken
//! together under the [`GuidelineCorpus`] publication lock, so a request
//! never mixes two versions of a guideline.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::types::ChunkMetadata;

pub mod corpus;
pub mod documents;
pub mod vector;

pub use corpus::{GuidelineCorpus, ReadView};
pub use documents::{GuidelineStore, MetadataFilter, StoreSnapshot, StoredChunk};
pub use vector::{MemoryVectorIndex, PublishedVectors};

/// One entry of a ranked index response.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// Published state of a vector index, fixed at the moment it was taken.
#[async_trait]
pub trait VectorSnapshot: Send + Sync {
    /// Top `k` entries by similarity to `vector`, best first.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>>;
}

/// Published state of a lexical index, fixed at the moment it was taken.
#[async_trait]
pub trait LexicalSnapshot: Send + Sync {
    async fn query(&self, terms: &[String], k: usize) -> Result<Vec<SearchHit>>;
}

/// Dense similarity index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Pin the currently published entries. Later publishes do not affect
    /// the returned view.
    fn snapshot(&self) -> Arc<dyn VectorSnapshot>;

    /// Top `k` entries of the current snapshot.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.snapshot().query(vector, k).await
    }

    /// Stage an entry, replacing any entry with the same chunk id.
    async fn upsert(&self, entry: VectorEntry) -> Result<()>;

    /// Stage removal of every entry belonging to `document_id`.
    async fn remove_document(&self, document_id: &str) -> Result<()>;

    /// Make staged writes visible to queries.
    async fn publish(&self) -> Result<()>;

    /// Drop staged writes that were not published.
    async fn discard(&self) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keyword (BM25-style) index.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    fn snapshot(&self) -> Arc<dyn LexicalSnapshot>;

    async fn query(&self, terms: &[String], k: usize) -> Result<Vec<SearchHit>> {
        self.snapshot().query(terms, k).await
    }

    async fn upsert(&self, chunk_id: &str, document_id: &str, text: &str) -> Result<()>;

    async fn remove_document(&self, document_id: &str) -> Result<()>;

    /// Persist staged writes without exposing them.
    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self) -> Result<()>;

    /// Drop uncommitted writes.
    async fn discard(&self) -> Result<()>;

    fn len(&self) -> usize;
}

/// Read access to chunk text and metadata.
pub trait DocumentStore: Send + Sync {
    /// Immutable view used for the whole lifetime of one request.
    fn snapshot(&self) -> Arc<StoreSnapshot>;

    /// Atomically replace one guideline and all of its chunks.
    fn replace_document(&self, metadata: crate::types::GuidelineMetadata, chunks: Vec<StoredChunk>);
}
