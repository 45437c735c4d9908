//! Guideline ingestion.
//!
//! Embeds every chunk first, then stages vector and lexical writes. Both
//! indexes and the document store are then swapped under the corpus
//! publication lock, so a request's read view holds either the previous or
//! the new version of a guideline and never a mix.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::error::{PipelineError, Service};
use crate::embeddings::EmbeddingModel;
use crate::resilience::{call_with_retry, RetryPolicy};
use crate::storage::{GuidelineCorpus, StoredChunk, VectorEntry};
use crate::types::{ChunkMetadata, GuidelineChunk, GuidelineMetadata};

const EMBED_BATCH_SIZE: usize = 32;

// ── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexReport {
    pub document_id: String,
    pub chunks_indexed: usize,
    /// Chunks of a previous version of the same document that were replaced.
    pub chunks_replaced: usize,
    pub store_version: u64,
}

// ── Indexer ────────────────────────────────────────────────────────────────

pub struct GuidelineIndexer {
    embedder: Arc<dyn EmbeddingModel>,
    corpus: Arc<GuidelineCorpus>,
    retry: RetryPolicy,
    /// One ingestion at a time; staged writes are shared index state.
    write_lock: tokio::sync::Mutex<()>,
}

impl GuidelineIndexer {
    pub fn new(embedder: Arc<dyn EmbeddingModel>, corpus: Arc<GuidelineCorpus>, retry: RetryPolicy) -> Self {
        Self {
            embedder,
            corpus,
            retry,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn index_document(
        &self,
        metadata: GuidelineMetadata,
        chunks: Vec<GuidelineChunk>,
    ) -> Result<IndexReport, PipelineError> {
        self.index_document_with_cancel(metadata, chunks, &CancellationToken::new())
            .await
    }

    pub async fn index_document_with_cancel(
        &self,
        metadata: GuidelineMetadata,
        chunks: Vec<GuidelineChunk>,
        cancel: &CancellationToken,
    ) -> Result<IndexReport, PipelineError> {
        validate_document(&metadata, &chunks)?;
        let _guard = self.write_lock.lock().await;

        let snapshot = self.corpus.documents().snapshot();
        if let Some(clash) = chunks.iter().find_map(|c| {
            snapshot
                .chunk(&c.chunk_id)
                .filter(|existing| existing.document_id != metadata.document_id)
        }) {
            return Err(PipelineError::InvalidDocument(format!(
                "chunk id '{}' already belongs to document '{}'",
                clash.chunk_id, clash.document_id
            )));
        }
        let chunks_replaced = snapshot
            .document(&metadata.document_id)
            .map(|_| snapshot.chunks_of(&metadata.document_id))
            .unwrap_or(0);

        tracing::info!(
            document_id = %metadata.document_id,
            organization = %metadata.organization,
            chunks = chunks.len(),
            "Indexing guideline"
        );

        // Embeddings first: any failure here leaves every index untouched
        let vectors = self.embed_chunks(&chunks, cancel).await?;

        let stored: Vec<StoredChunk> = chunks
            .iter()
            .map(|chunk| StoredChunk {
                chunk_id: chunk.chunk_id.clone(),
                document_id: metadata.document_id.clone(),
                text: chunk.text.clone(),
                metadata: ChunkMetadata::from_guideline(&metadata, chunk),
            })
            .collect();

        let staged = match self.stage(&metadata.document_id, &stored, vectors, cancel).await {
            Ok(()) => cancel.check(),
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            tracing::error!(document_id = %metadata.document_id, error = %e, "Ingestion stopped before publish, discarding writes");
            self.discard_staged().await;
            return Err(e);
        }

        let store_version = self.publish(&metadata, stored).await?;

        tracing::info!(
            document_id = %metadata.document_id,
            chunks = chunks.len(),
            chunks_replaced,
            store_version,
            "Guideline indexed"
        );

        Ok(IndexReport {
            document_id: metadata.document_id,
            chunks_indexed: chunks.len(),
            chunks_replaced,
            store_version,
        })
    }

    async fn embed_chunks(
        &self,
        chunks: &[GuidelineChunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedder = self.embedder.clone();
            let embedded = call_with_retry(&self.retry, Service::Embedding, cancel, || {
                let embedder = embedder.clone();
                let texts = texts.clone();
                async move { embedder.embed_documents(&texts).await }
            })
            .await?;

            if embedded.len() != batch.len() {
                return Err(PipelineError::Collaborator {
                    service: Service::Embedding,
                    attempts: 1,
                    message: format!("expected {} embeddings, got {}", batch.len(), embedded.len()),
                });
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    async fn stage(
        &self,
        document_id: &str,
        stored: &[StoredChunk],
        vectors: Vec<Vec<f32>>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let index = self.corpus.vectors().clone();
        call_with_retry(&self.retry, Service::VectorIndex, cancel, || {
            let index = index.clone();
            let document_id = document_id.to_string();
            async move { index.remove_document(&document_id).await }
        })
        .await?;

        for (chunk, vector) in stored.iter().zip(vectors) {
            let entry = VectorEntry {
                chunk_id: chunk.chunk_id.clone(),
                document_id: chunk.document_id.clone(),
                vector,
                metadata: chunk.metadata.clone(),
            };
            call_with_retry(&self.retry, Service::VectorIndex, cancel, || {
                let index = index.clone();
                let entry = entry.clone();
                async move { index.upsert(entry).await }
            })
            .await?;
        }

        let lexical = self.corpus.lexical().clone();
        call_with_retry(&self.retry, Service::LexicalIndex, cancel, || {
            let lexical = lexical.clone();
            let document_id = document_id.to_string();
            async move { lexical.remove_document(&document_id).await }
        })
        .await?;
        for chunk in stored {
            call_with_retry(&self.retry, Service::LexicalIndex, cancel, || {
                let lexical = lexical.clone();
                let chunk = chunk.clone();
                async move { lexical.upsert(&chunk.chunk_id, &chunk.document_id, &chunk.text).await }
            })
            .await?;
        }
        call_with_retry(&self.retry, Service::LexicalIndex, cancel, || {
            let lexical = lexical.clone();
            async move { lexical.commit().await }
        })
        .await?;

        Ok(())
    }

    /// Swap the vector snapshot, reload the lexical reader and replace the
    /// store entry while no read view can be taken. Not cancellable. Returns
    /// the new store version.
    async fn publish(&self, metadata: &GuidelineMetadata, stored: Vec<StoredChunk>) -> Result<u64, PipelineError> {
        let never = CancellationToken::new();
        let _publication = self.corpus.lock_publication().await;

        let index = self.corpus.vectors().clone();
        call_with_retry(&self.retry, Service::VectorIndex, &never, || {
            let index = index.clone();
            async move { index.publish().await }
        })
        .await?;

        let lexical = self.corpus.lexical().clone();
        call_with_retry(&self.retry, Service::LexicalIndex, &never, || {
            let lexical = lexical.clone();
            async move { lexical.publish().await }
        })
        .await?;

        let documents = self.corpus.documents();
        documents.replace_document(metadata.clone(), stored);
        Ok(documents.snapshot().version())
    }

    async fn discard_staged(&self) {
        if let Err(e) = self.corpus.vectors().discard().await {
            tracing::warn!(error = %e, "Failed to discard staged vector writes");
        }
        if let Err(e) = self.corpus.lexical().discard().await {
            tracing::warn!(error = %e, "Failed to discard staged lexical writes");
        }
    }
}

/// Structural checks done before any external call.
pub fn validate_document(metadata: &GuidelineMetadata, chunks: &[GuidelineChunk]) -> Result<(), PipelineError> {
    if metadata.document_id.trim().is_empty() {
        return Err(PipelineError::InvalidDocument("document id is empty".into()));
    }
    if chunks.is_empty() {
        return Err(PipelineError::InvalidDocument(format!(
            "document '{}' has no chunks",
            metadata.document_id
        )));
    }

    let mut seen = HashSet::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.chunk_id.trim().is_empty() {
            return Err(PipelineError::InvalidDocument("chunk id is empty".into()));
        }
        if !seen.insert(chunk.chunk_id.as_str()) {
            return Err(PipelineError::InvalidDocument(format!(
                "duplicate chunk id '{}'",
                chunk.chunk_id
            )));
        }
        if chunk.text.trim().is_empty() {
            return Err(PipelineError::InvalidDocument(format!(
                "chunk '{}' has no text",
                chunk.chunk_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::search::TextSearch;
    use crate::storage::{DocumentStore, GuidelineStore, MemoryVectorIndex, VectorIndex};
    use crate::test_support::{guideline, guideline_chunk, FailingEmbedder};

    struct Fixture {
        indexer: Arc<GuidelineIndexer>,
        corpus: Arc<GuidelineCorpus>,
        vectors: Arc<MemoryVectorIndex>,
        lexical: Arc<TextSearch>,
        store: Arc<GuidelineStore>,
    }

    fn fixture(embedder: Arc<dyn EmbeddingModel>) -> Fixture {
        let vectors = Arc::new(MemoryVectorIndex::new(64));
        let lexical = Arc::new(TextSearch::in_memory().unwrap());
        let store = Arc::new(GuidelineStore::new());
        let corpus = Arc::new(GuidelineCorpus::new(vectors.clone(), lexical.clone(), store.clone()));
        let indexer = Arc::new(GuidelineIndexer::new(embedder, corpus.clone(), RetryPolicy::default()));
        Fixture {
            indexer,
            corpus,
            vectors,
            lexical,
            store,
        }
    }

    #[tokio::test]
    async fn test_index_document_publishes_everywhere() {
        let f = fixture(Arc::new(HashingEmbedder::new(64)));
        let report = f
            .indexer
            .index_document(
                guideline("who-htn", "WHO"),
                vec![
                    guideline_chunk("c1", "Definitions", "Hypertension is defined as blood pressure of 140/90 mmHg."),
                    guideline_chunk("c2", "Recommendations", "Salt reduction is recommended."),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.chunks_indexed, 2);
        assert_eq!(report.chunks_replaced, 0);
        assert_eq!(f.vectors.len(), 2);
        assert_eq!(f.lexical.count(), 2);
        let snapshot = f.store.snapshot();
        assert_eq!(snapshot.chunk_count(), 2);
        assert_eq!(snapshot.version(), report.store_version);
    }

    #[tokio::test]
    async fn test_reindexing_replaces_previous_chunks() {
        let f = fixture(Arc::new(HashingEmbedder::new(64)));
        f.indexer
            .index_document(
                guideline("who-htn", "WHO"),
                vec![
                    guideline_chunk("c1", "Definitions", "Old definition of hypertension."),
                    guideline_chunk("c2", "Background", "Old background text."),
                ],
            )
            .await
            .unwrap();
        let report = f
            .indexer
            .index_document(
                guideline("who-htn", "WHO"),
                vec![guideline_chunk("c3", "Definitions", "New definition of hypertension.")],
            )
            .await
            .unwrap();

        assert_eq!(report.chunks_replaced, 2);
        assert_eq!(f.vectors.len(), 1);
        assert_eq!(f.lexical.count(), 1);
        let snapshot = f.store.snapshot();
        assert!(snapshot.chunk("c1").is_none());
        assert!(snapshot.chunk("c3").is_some());
    }

    #[tokio::test]
    async fn test_publication_waits_for_the_publication_lock() {
        let f = fixture(Arc::new(HashingEmbedder::new(64)));
        let held = f.corpus.lock_publication().await;

        let ingest = {
            let indexer = f.indexer.clone();
            tokio::spawn(async move {
                indexer
                    .index_document(guideline("who-htn", "WHO"), vec![guideline_chunk("c1", "S", "Some text.")])
                    .await
            })
        };
        // Long enough to embed and stage; the publish step is parked on the lock
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!ingest.is_finished());
        assert_eq!(f.vectors.len(), 0);
        assert_eq!(f.lexical.count(), 0);
        assert_eq!(f.store.snapshot().chunk_count(), 0);

        drop(held);
        let report = ingest.await.unwrap().unwrap();
        assert_eq!(report.chunks_indexed, 1);
        assert_eq!(f.vectors.len(), 1);
        assert_eq!(f.lexical.count(), 1);
        assert_eq!(f.store.snapshot().chunk_count(), 1);
    }

    /// Cancels its token while the document batch is being embedded.
    struct CancellingEmbedder {
        inner: HashingEmbedder,
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl EmbeddingModel for CancellingEmbedder {
        async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.inner.embed(text)
        }

        async fn embed_document(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.cancel.cancel();
            self.inner.embed(text)
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    #[tokio::test]
    async fn test_cancel_before_publish_discards_staged_writes() {
        let cancel = CancellationToken::new();
        let f = fixture(Arc::new(CancellingEmbedder {
            inner: HashingEmbedder::new(64),
            cancel: cancel.clone(),
        }));
        let err = f
            .indexer
            .index_document_with_cancel(guideline("who-htn", "WHO"), vec![guideline_chunk("c1", "S", "Some text.")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));

        f.indexer
            .index_document(guideline("cdc-flu", "CDC"), vec![guideline_chunk("f1", "S", "Influenza text.")])
            .await
            .unwrap();
        assert_eq!(f.vectors.len(), 1);
        assert_eq!(f.lexical.count(), 1);
        assert!(f.store.snapshot().chunk("c1").is_none());
    }

    #[tokio::test]
    async fn test_invalid_documents_are_rejected_before_embedding() {
        let f = fixture(Arc::new(FailingEmbedder::new()));
        let err = f
            .indexer
            .index_document(guideline("", "WHO"), vec![guideline_chunk("c1", "S", "text")])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDocument(_)));

        let err = f
            .indexer
            .index_document(
                guideline("d", "WHO"),
                vec![guideline_chunk("c1", "S", "a"), guideline_chunk("c1", "S", "b")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDocument(_)));

        let err = f
            .indexer
            .index_document(guideline("d", "WHO"), vec![guideline_chunk("c1", "S", "   ")])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_chunk_id_owned_by_other_document_is_rejected() {
        let f = fixture(Arc::new(HashingEmbedder::new(64)));
        f.indexer
            .index_document(guideline("a", "WHO"), vec![guideline_chunk("shared", "S", "First document text.")])
            .await
            .unwrap();
        let err = f
            .indexer
            .index_document(guideline("b", "CDC"), vec![guideline_chunk("shared", "S", "Second document text.")])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDocument(_)));
        assert_eq!(f.store.snapshot().document_count(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_indexes_untouched() {
        let f = fixture(Arc::new(FailingEmbedder::new()));
        let err = f
            .indexer
            .index_document(guideline("who-htn", "WHO"), vec![guideline_chunk("c1", "S", "Some text.")])
            .await
            .unwrap_err();
        assert_eq!(err.service(), Some(Service::Embedding));
        assert_eq!(f.vectors.len(), 0);
        assert_eq!(f.lexical.count(), 0);
        assert_eq!(f.store.snapshot().chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_discards_staged_writes() {
        // Embedder dimension 32 against a 64-dimension index
        let f = fixture(Arc::new(HashingEmbedder::new(32)));
        let err = f
            .indexer
            .index_document(guideline("who-htn", "WHO"), vec![guideline_chunk("c1", "S", "Some text.")])
            .await
            .unwrap_err();
        assert_eq!(err.service(), Some(Service::VectorIndex));

        f.vectors.publish().await.unwrap();
        assert_eq!(f.vectors.len(), 0);
        assert_eq!(f.store.snapshot().chunk_count(), 0);
    }
}
