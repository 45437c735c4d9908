//! Hybrid guideline retrieval.
//!
//! Each sub-query runs a dense and a lexical search concurrently, fuses them
//! with reciprocal rank fusion and reranks the head with medical signals.
//! Results of all sub-queries are merged by chunk id. Every lookup of one
//! request goes through the same [`ReadView`].

use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::config::SearchConfig;
use crate::embeddings::EmbeddingModel;
use crate::error::{PipelineError, Service};
use crate::reranking::MedicalReranker;
use crate::resilience::{call_with_retry, RetryPolicy};
use crate::search::{keyword_terms, reciprocal_rank_fusion};
use crate::storage::{GuidelineCorpus, ReadView, SearchHit};
use crate::types::{QueryAnalysis, RetrievedChunk};

pub struct RetrievalEngine {
    embedder: Arc<dyn EmbeddingModel>,
    corpus: Arc<GuidelineCorpus>,
    reranker: MedicalReranker,
    config: SearchConfig,
    retry: RetryPolicy,
}

impl RetrievalEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        corpus: Arc<GuidelineCorpus>,
        config: SearchConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            embedder,
            corpus,
            reranker: MedicalReranker::new(&config),
            config,
            retry,
        }
    }

    /// Ranked chunks for every sub-query of `analysis`, best first. An empty
    /// result means no evidence cleared the relevance floor.
    pub async fn retrieve(
        &self,
        analysis: &QueryAnalysis,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>, PipelineError> {
        cancel.check()?;
        let view = self.corpus.read_view().await;
        if view.documents.chunk_count() == 0 {
            tracing::debug!("Document store is empty, skipping retrieval");
            return Ok(Vec::new());
        }

        let queries = analysis.retrieval_queries();
        let per_query = try_join_all(
            queries
                .iter()
                .enumerate()
                .map(|(index, query)| self.retrieve_sub_query(analysis, index, query, &view, cancel)),
        )
        .await?;

        let merged = merge_sub_query_results(per_query, self.config.max_results);
        tracing::debug!(
            sub_queries = queries.len(),
            results = merged.len(),
            store_version = view.documents.version(),
            "Retrieval complete"
        );
        Ok(merged)
    }

    async fn retrieve_sub_query(
        &self,
        analysis: &QueryAnalysis,
        index: usize,
        query: &str,
        view: &ReadView,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>, PipelineError> {
        let terms = lexical_terms(query, &analysis.entities);

        let (dense, sparse) = tokio::try_join!(
            self.dense_search(view, query, cancel),
            self.sparse_search(view, &terms, cancel)
        )?;

        let fused = reciprocal_rank_fusion(&dense, &sparse, self.config.rrf_k);
        let candidates: Vec<RetrievedChunk> = fused
            .into_iter()
            .filter_map(|candidate| {
                let Some(stored) = view.documents.chunk(&candidate.chunk_id) else {
                    // Orphaned by a partially failed publication
                    tracing::trace!(chunk_id = %candidate.chunk_id, "Dropping candidate missing from store");
                    return None;
                };
                Some(RetrievedChunk {
                    chunk_id: candidate.chunk_id,
                    document_id: stored.document_id.clone(),
                    text: stored.text.clone(),
                    metadata: stored.metadata.clone(),
                    relevance_score: candidate.score,
                    rerank_score: None,
                    dense_rank: candidate.dense_rank,
                    sparse_rank: candidate.sparse_rank,
                    sub_queries: vec![index],
                })
            })
            .take(self.config.rerank_candidates)
            .collect();

        let candidate_count = candidates.len();
        let mut ranked = self.reranker.rerank(analysis, candidates);
        ranked.retain(|chunk| chunk.score() >= self.config.relevance_floor);
        ranked.truncate(self.config.rerank_top_k);

        tracing::debug!(
            sub_query = index,
            dense_hits = dense.len(),
            sparse_hits = sparse.len(),
            candidates = candidate_count,
            kept = ranked.len(),
            "Sub-query retrieved"
        );
        Ok(ranked)
    }

    async fn dense_search(
        &self,
        view: &ReadView,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, PipelineError> {
        if self.config.k_dense == 0 {
            return Ok(Vec::new());
        }

        let embedder = self.embedder.clone();
        let embedding = call_with_retry(&self.retry, Service::Embedding, cancel, || {
            let embedder = embedder.clone();
            let query = query.to_string();
            async move { embedder.embed_query(&query).await }
        })
        .await?;
        if embedding.iter().all(|v| *v == 0.0) {
            return Ok(Vec::new());
        }

        let vectors = view.vectors.clone();
        let k = self.config.k_dense;
        let hits = call_with_retry(&self.retry, Service::VectorIndex, cancel, || {
            let vectors = vectors.clone();
            let embedding = embedding.clone();
            async move { vectors.query(&embedding, k).await }
        })
        .await?;

        let min = self.config.min_dense_similarity;
        Ok(hits.into_iter().filter(|hit| hit.score >= min).collect())
    }

    async fn sparse_search(
        &self,
        view: &ReadView,
        terms: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, PipelineError> {
        if terms.is_empty() || self.config.k_sparse == 0 {
            return Ok(Vec::new());
        }

        let lexical = view.lexical.clone();
        let k = self.config.k_sparse;
        let hits = call_with_retry(&self.retry, Service::LexicalIndex, cancel, || {
            let lexical = lexical.clone();
            let terms = terms.to_vec();
            async move { lexical.query(&terms, k).await }
        })
        .await?;

        Ok(hits.into_iter().filter(|hit| hit.score > 0.0).collect())
    }
}

/// Keyword terms of the sub-query plus the analyzed entities it mentions.
pub fn lexical_terms(query: &str, entities: &[String]) -> Vec<String> {
    let mut terms = keyword_terms(query);
    let lower = query.to_lowercase();
    for entity in entities {
        if lower.contains(entity.as_str()) && !terms.contains(entity) {
            terms.push(entity.clone());
        }
    }
    terms
}

/// Merge per-sub-query rankings. A chunk found by several sub-queries keeps
/// its best-ranked copy and the union of the sub-query indices.
pub fn merge_sub_query_results(results: Vec<Vec<RetrievedChunk>>, max_results: usize) -> Vec<RetrievedChunk> {
    let mut by_id: BTreeMap<String, RetrievedChunk> = BTreeMap::new();
    let mut sub_queries: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();

    for chunk in results.into_iter().flatten() {
        sub_queries
            .entry(chunk.chunk_id.clone())
            .or_default()
            .extend(chunk.sub_queries.iter().copied());

        match by_id.get(&chunk.chunk_id) {
            Some(existing) if existing.rank_key().compare(&chunk.rank_key()).is_le() => {}
            _ => {
                by_id.insert(chunk.chunk_id.clone(), chunk);
            }
        }
    }

    let mut merged: Vec<RetrievedChunk> = by_id
        .into_values()
        .map(|mut chunk| {
            if let Some(indices) = sub_queries.remove(&chunk.chunk_id) {
                chunk.sub_queries = indices.into_iter().collect();
            }
            chunk
        })
        .collect();
    merged.sort_by(|a, b| a.rank_key().compare(&b.rank_key()));
    merged.truncate(max_results);
    merged
}
