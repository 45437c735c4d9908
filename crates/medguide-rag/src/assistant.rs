//! Pipeline orchestrator.
//!
//! Runs one query through analysis, retrieval, synthesis and validation.
//! Each gate can end the run early:
//!
//! ```text
//! Start -> Analyzed -> Retrieved | InsufficientEvidence -> Synthesized -> Validated -> Done
//!             |  \
//!             |   `-> Done (refused)
//!             `-----> Done (conversational)
//! ```
//!
//! Collaborator failures become a system-error response, never a refusal or
//! an empty-evidence answer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::config::AssistantConfig;
use crate::embeddings::{CachedEmbedder, EmbeddingModel, HashingEmbedder};
use crate::error::{PipelineError, Service};
use crate::indexing::{GuidelineIndexer, IndexReport};
use crate::llm::CompletionProvider;
use crate::rag::query_analyzer::{QueryAnalyzer, QueryClassifier, RuleBasedClassifier, SUPPORTED_SOURCES};
use crate::rag::safety::{
    refusal_message, SafetyValidator, CONVERSATIONAL_RESPONSE, NO_EVIDENCE_RESPONSE, SYSTEM_ERROR_RESPONSE,
};
use crate::rag::synthesizer::AnswerSynthesizer;
use crate::resilience::RetryPolicy;
use crate::retrieval::RetrievalEngine;
use crate::search::TextSearch;
use crate::storage::{
    DocumentStore, GuidelineCorpus, GuidelineStore, LexicalIndex, MemoryVectorIndex, MetadataFilter, StoredChunk,
    VectorIndex,
};
use crate::types::{
    GuidelineChunk, GuidelineMetadata, MedicalIntent, MedicalResponse, QueryAnalysis, RefusalReason,
    ResponseOutcome, SafetyCheck, ViolationCode,
};

const QUERY_LOG_CHARS: usize = 80;

/// The services the pipeline calls out to.
pub struct Collaborators {
    pub completion: Arc<dyn CompletionProvider>,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub vectors: Arc<dyn VectorIndex>,
    pub lexical: Arc<dyn LexicalIndex>,
    pub documents: Arc<dyn DocumentStore>,
    pub classifier: Arc<dyn QueryClassifier>,
}

impl Collaborators {
    /// In-process stack around an external completion service: hashing
    /// embeddings behind an LRU cache, an in-memory vector index, a tantivy
    /// lexical index (files under `index_dir` when set) and the rule-based
    /// classifier. Every store starts empty.
    pub fn local(config: &AssistantConfig, completion: Arc<dyn CompletionProvider>) -> Result<Self, PipelineError> {
        let dimension = config.embedding.dimension;
        let hashing: Arc<dyn EmbeddingModel> = Arc::new(HashingEmbedder::new(dimension));
        let embedder = Arc::new(CachedEmbedder::new(hashing, config.embedding.cache_size));

        let lexical = match config.index_dir {
            Some(ref dir) => open_lexical_dir(dir),
            None => TextSearch::in_memory(),
        }
        .map_err(|e| PipelineError::Collaborator {
            service: Service::LexicalIndex,
            attempts: 1,
            message: format!("{:#}", e),
        })?;

        Ok(Self {
            completion,
            embedder,
            vectors: Arc::new(MemoryVectorIndex::new(dimension)),
            lexical: Arc::new(lexical),
            documents: Arc::new(GuidelineStore::new()),
            classifier: Arc::new(RuleBasedClassifier::new()),
        })
    }
}

/// Opens the lexical index under `dir` and drops entries left by a previous
/// process; the vector index and document store do not survive restarts.
fn open_lexical_dir(dir: &std::path::Path) -> anyhow::Result<TextSearch> {
    let index = TextSearch::open(dir)?;
    let stale = index.count();
    if stale > 0 {
        tracing::info!(
            path = %dir.display(),
            stale_entries = stale,
            "Clearing lexical index from a previous run, guidelines must be re-ingested"
        );
        index.clear()?;
    }
    Ok(index)
}

/// Index sizes and safety settings, for health endpoints and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantStats {
    pub total_documents: usize,
    pub total_chunks: usize,
    pub vector_entries: usize,
    pub lexical_entries: usize,
    pub store_version: u64,
    pub supported_sources: Vec<String>,
    pub educational_disclaimer: bool,
    pub low_confidence_threshold: f32,
    pub min_answer_confidence: f32,
}

pub struct MedicalAssistant {
    config: AssistantConfig,
    analyzer: QueryAnalyzer,
    retrieval: RetrievalEngine,
    synthesizer: AnswerSynthesizer,
    safety: SafetyValidator,
    indexer: GuidelineIndexer,
    corpus: Arc<GuidelineCorpus>,
}

impl MedicalAssistant {
    /// Assistant over the local in-process stack.
    pub fn new(config: AssistantConfig, completion: Arc<dyn CompletionProvider>) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        let collaborators = Collaborators::local(&config, completion)?;
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: AssistantConfig, collaborators: Collaborators) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        let retry = RetryPolicy::from(&config.resilience);
        let Collaborators {
            completion,
            embedder,
            vectors,
            lexical,
            documents,
            classifier,
        } = collaborators;

        tracing::info!(
            provider = completion.name(),
            embedding_dimension = embedder.dimension(),
            rerank_top_k = config.search.rerank_top_k,
            relevance_floor = config.search.relevance_floor,
            "Medical assistant initialized"
        );

        let corpus = Arc::new(GuidelineCorpus::new(vectors, lexical, documents));
        Ok(Self {
            analyzer: QueryAnalyzer::new(classifier),
            retrieval: RetrievalEngine::new(
                embedder.clone(),
                corpus.clone(),
                config.search.clone(),
                retry.clone(),
            ),
            synthesizer: AnswerSynthesizer::new(completion, config.synthesis.clone(), retry.clone()),
            safety: SafetyValidator::new(config.safety.clone()),
            indexer: GuidelineIndexer::new(embedder, corpus.clone(), retry),
            corpus,
            config,
        })
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub async fn process_query(&self, query: &str) -> MedicalResponse {
        self.process_query_with_cancel(query, &CancellationToken::new()).await
    }

    /// Always returns a well-formed response; failures become a system-error
    /// response.
    pub async fn process_query_with_cancel(&self, query: &str, cancel: &CancellationToken) -> MedicalResponse {
        match self.try_process_query(query, cancel).await {
            Ok(response) => response,
            Err(PipelineError::Cancelled) => {
                tracing::info!(query = %preview(query), "Query cancelled");
                system_error_response(query)
            }
            Err(e) => {
                tracing::error!(query = %preview(query), error = %e, service = ?e.service(), "Query failed");
                system_error_response(query)
            }
        }
    }

    /// Like [`process_query_with_cancel`](Self::process_query_with_cancel) but
    /// surfaces collaborator failures and cancellation to the caller.
    pub async fn try_process_query(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<MedicalResponse, PipelineError> {
        cancel.check()?;
        tracing::info!(query = %preview(query), query_len = query.len(), "Processing query");

        if query.trim().is_empty() {
            tracing::warn!("Empty query");
            return Ok(self.insufficient_evidence_response(query));
        }

        // Start -> Analyzed
        let analysis = self.analyzer.analyze(query, cancel).await;
        tracing::info!(
            intent = ?analysis.intent,
            confidence = analysis.classification_confidence,
            risk_flags = ?analysis.risk_flags,
            "Query analyzed"
        );

        if let Some(check) = self.safety.screen_query(&analysis) {
            return Ok(self.refusal_response(&analysis, check, 0.0));
        }
        if analysis.intent == MedicalIntent::Conversational {
            return Ok(conversational_response(query));
        }

        // Analyzed -> Retrieved
        let chunks = self.retrieval.retrieve(&analysis, cancel).await?;
        if chunks.is_empty() {
            tracing::warn!(intent = ?analysis.intent, "No guideline evidence cleared the relevance floor");
            return Ok(self.insufficient_evidence_response(query));
        }
        tracing::info!(chunks = chunks.len(), top_score = chunks[0].score(), "Evidence retrieved");

        // Retrieved -> Synthesized
        let synthesized = self.synthesizer.synthesize(&analysis, &chunks, cancel).await?;
        tracing::info!(
            citations = synthesized.citations.len(),
            coverage = synthesized.coverage,
            confidence = synthesized.confidence,
            "Answer synthesized"
        );

        // Synthesized -> Validated
        let check = self.safety.validate(
            &analysis,
            &synthesized.answer,
            &synthesized.citations,
            synthesized.confidence,
        );
        if !check.is_safe {
            return Ok(self.refusal_response(&analysis, check, synthesized.confidence));
        }

        if synthesized.confidence < self.config.safety.min_answer_confidence {
            tracing::warn!(
                confidence = synthesized.confidence,
                min = self.config.safety.min_answer_confidence,
                "Answer confidence below configured minimum"
            );
        }
        tracing::info!(confidence = synthesized.confidence, violations = ?check.violations, "Answer validated");

        Ok(MedicalResponse {
            query: query.to_string(),
            answer: synthesized.answer,
            citations: synthesized.citations,
            confidence_score: synthesized.confidence,
            disclaimer: self.safety.disclaimer(&check),
            safety_check: check,
            outcome: ResponseOutcome::Answered,
            retrieved_chunks: synthesized.context,
        })
    }

    /// Ingest one parsed guideline; replaces any earlier version of it.
    pub async fn index_document(
        &self,
        metadata: GuidelineMetadata,
        chunks: Vec<GuidelineChunk>,
    ) -> Result<IndexReport, PipelineError> {
        self.indexer.index_document(metadata, chunks).await
    }

    pub async fn index_document_with_cancel(
        &self,
        metadata: GuidelineMetadata,
        chunks: Vec<GuidelineChunk>,
        cancel: &CancellationToken,
    ) -> Result<IndexReport, PipelineError> {
        self.indexer.index_document_with_cancel(metadata, chunks, cancel).await
    }

    pub fn stats(&self) -> AssistantStats {
        let snapshot = self.corpus.documents().snapshot();
        AssistantStats {
            total_documents: snapshot.document_count(),
            total_chunks: snapshot.chunk_count(),
            vector_entries: self.corpus.vectors().len(),
            lexical_entries: self.corpus.lexical().len(),
            store_version: snapshot.version(),
            supported_sources: SUPPORTED_SOURCES.iter().map(|s| s.to_string()).collect(),
            educational_disclaimer: self.config.safety.educational_disclaimer,
            low_confidence_threshold: self.config.safety.low_confidence_threshold,
            min_answer_confidence: self.config.safety.min_answer_confidence,
        }
    }

    /// Chunks whose metadata matches `filter`, without ranking.
    pub fn search_by_metadata(&self, filter: &MetadataFilter, limit: usize) -> Vec<Arc<StoredChunk>> {
        self.corpus.documents().snapshot().search_by_metadata(filter, limit)
    }

    fn refusal_response(&self, analysis: &QueryAnalysis, check: SafetyCheck, confidence: f32) -> MedicalResponse {
        let reason = check.refusal_reason.unwrap_or(RefusalReason::UnsafeQuery);
        tracing::warn!(
            intent = ?analysis.intent,
            reason = reason.as_str(),
            violations = ?check.violations,
            "Query refused"
        );
        MedicalResponse {
            query: analysis.query.clone(),
            answer: refusal_message(reason),
            citations: Vec::new(),
            confidence_score: confidence,
            disclaimer: self.safety.disclaimer(&check),
            safety_check: check,
            outcome: ResponseOutcome::Refused,
            retrieved_chunks: Vec::new(),
        }
    }

    fn insufficient_evidence_response(&self, query: &str) -> MedicalResponse {
        let check = SafetyCheck::safe(self.config.safety.educational_disclaimer);
        MedicalResponse {
            query: query.to_string(),
            answer: NO_EVIDENCE_RESPONSE.to_string(),
            citations: Vec::new(),
            confidence_score: 0.0,
            disclaimer: self.safety.disclaimer(&check),
            safety_check: check,
            outcome: ResponseOutcome::InsufficientEvidence,
            retrieved_chunks: Vec::new(),
        }
    }
}

fn conversational_response(query: &str) -> MedicalResponse {
    MedicalResponse {
        query: query.to_string(),
        answer: CONVERSATIONAL_RESPONSE.to_string(),
        citations: Vec::new(),
        confidence_score: 1.0,
        safety_check: SafetyCheck::safe(false),
        disclaimer: String::new(),
        outcome: ResponseOutcome::Conversational,
        retrieved_chunks: Vec::new(),
    }
}

fn system_error_response(query: &str) -> MedicalResponse {
    MedicalResponse {
        query: query.to_string(),
        answer: SYSTEM_ERROR_RESPONSE.to_string(),
        citations: Vec::new(),
        confidence_score: 0.0,
        safety_check: SafetyCheck {
            is_safe: false,
            violations: vec![ViolationCode::SystemError],
            requires_disclaimer: false,
            refusal_reason: None,
        },
        disclaimer: String::new(),
        outcome: ResponseOutcome::SystemError,
        retrieved_chunks: Vec::new(),
    }
}

fn preview(query: &str) -> String {
    let mut preview: String = query.chars().take(QUERY_LOG_CHARS).collect();
    if query.chars().count() > QUERY_LOG_CHARS {
        preview.push_str("...");
    }
    preview
}
