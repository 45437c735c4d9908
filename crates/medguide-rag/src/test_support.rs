//! Scripted collaborators and fixtures shared by unit tests.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::embeddings::EmbeddingModel;
use crate::error::ServiceError;
use crate::llm::{CompletionProvider, GenerationConfig};
use crate::search::{PinnedSearcher, TextSearch};
use crate::storage::{
    LexicalIndex, LexicalSnapshot, MemoryVectorIndex, SearchHit, VectorEntry, VectorIndex, VectorSnapshot,
};
use crate::types::{
    ChunkMetadata, GuidelineChunk, GuidelineMetadata, MedicalIntent, QueryAnalysis, RetrievedChunk, SectionKind,
};

/// Replays canned completions in order, cycling when exhausted, and records
/// every prompt it receives.
pub struct ScriptedCompletion {
    responses: Vec<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: responses.into_iter().map(str::to_string).collect(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    async fn complete(&self, prompt: &str, _config: &GenerationConfig) -> Result<String> {
        let mut prompts = self.prompts.lock();
        let index = prompts.len();
        prompts.push(prompt.to_string());
        Ok(self.responses[index % self.responses.len()].clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub struct FailingCompletion {
    error: fn() -> ServiceError,
    calls: AtomicUsize,
}

impl FailingCompletion {
    pub fn fatal() -> Self {
        Self {
            error: || ServiceError::Rejected("401 invalid api key".into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for FailingCompletion {
    async fn complete(&self, _prompt: &str, _config: &GenerationConfig) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)().into())
    }
}

/// Embedder whose every call is rejected.
pub struct FailingEmbedder;

impl FailingEmbedder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EmbeddingModel for FailingEmbedder {
    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
        Err(ServiceError::Rejected("embedding model unavailable".into()).into())
    }

    async fn embed_document(&self, _text: &str) -> Result<Vec<f32>> {
        Err(ServiceError::Rejected("embedding model unavailable".into()).into())
    }

    fn dimension(&self) -> usize {
        64
    }
}

/// In-memory vector index that counts queries made through its snapshots.
pub struct CountingVectorIndex {
    inner: MemoryVectorIndex,
    queries: Arc<AtomicUsize>,
}

impl CountingVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: MemoryVectorIndex::new(dimension),
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

struct CountingVectorSnapshot {
    inner: Arc<dyn VectorSnapshot>,
    queries: Arc<AtomicUsize>,
}

#[async_trait]
impl VectorSnapshot for CountingVectorSnapshot {
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(vector, k).await
    }
}

#[async_trait]
impl VectorIndex for CountingVectorIndex {
    fn snapshot(&self) -> Arc<dyn VectorSnapshot> {
        Arc::new(CountingVectorSnapshot {
            inner: self.inner.snapshot(),
            queries: self.queries.clone(),
        })
    }

    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        self.inner.upsert(entry).await
    }

    async fn remove_document(&self, document_id: &str) -> Result<()> {
        self.inner.remove_document(document_id).await
    }

    async fn publish(&self) -> Result<()> {
        self.inner.publish().await
    }

    async fn discard(&self) -> Result<()> {
        self.inner.discard().await
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Holds gated calls until the test opens the gate.
pub struct Gate {
    entered: AtomicUsize,
    permits: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: AtomicUsize::new(0),
            permits: Semaphore::new(0),
        })
    }

    async fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }

    /// Wait until `count` calls are parked at the gate.
    pub async fn wait_for_waiters(&self, count: usize) {
        while self.entered.load(Ordering::SeqCst) < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Let `count` parked or future calls through.
    pub fn open(&self, count: usize) {
        self.permits.add_permits(count);
    }
}

/// Embedder whose query embeddings wait at a [`Gate`]. Document embeddings
/// pass straight through.
pub struct GatedEmbedder {
    inner: Arc<dyn EmbeddingModel>,
    gate: Arc<Gate>,
}

impl GatedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingModel>, gate: Arc<Gate>) -> Self {
        Self { inner, gate }
    }
}

#[async_trait]
impl EmbeddingModel for GatedEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.gate.pass().await;
        self.inner.embed_query(text).await
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed_document(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// In-memory tantivy index that counts snapshot queries and optionally holds
/// them at a [`Gate`].
pub struct CountingLexicalIndex {
    inner: TextSearch,
    queries: Arc<AtomicUsize>,
    gate: Option<Arc<Gate>>,
}

impl CountingLexicalIndex {
    pub fn new() -> Self {
        Self {
            inner: TextSearch::in_memory().expect("in-memory tantivy index"),
            queries: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    pub fn gated(gate: Arc<Gate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

struct CountingLexicalSnapshot {
    inner: PinnedSearcher,
    queries: Arc<AtomicUsize>,
    gate: Option<Arc<Gate>>,
}

#[async_trait]
impl LexicalSnapshot for CountingLexicalSnapshot {
    async fn query(&self, terms: &[String], k: usize) -> Result<Vec<SearchHit>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        self.inner.search(terms, k)
    }
}

#[async_trait]
impl LexicalIndex for CountingLexicalIndex {
    fn snapshot(&self) -> Arc<dyn LexicalSnapshot> {
        Arc::new(CountingLexicalSnapshot {
            inner: self.inner.pinned(),
            queries: self.queries.clone(),
            gate: self.gate.clone(),
        })
    }

    async fn upsert(&self, chunk_id: &str, document_id: &str, text: &str) -> Result<()> {
        self.inner.index_chunk(chunk_id, document_id, text)
    }

    async fn remove_document(&self, document_id: &str) -> Result<()> {
        self.inner.delete_document(document_id);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    async fn publish(&self) -> Result<()> {
        self.inner.reload()
    }

    async fn discard(&self) -> Result<()> {
        self.inner.rollback()
    }

    fn len(&self) -> usize {
        self.inner.count()
    }
}

pub fn guideline(document_id: &str, organization: &str) -> GuidelineMetadata {
    GuidelineMetadata {
        document_id: document_id.into(),
        title: format!("{} clinical guideline", organization),
        organization: organization.into(),
        year: Some(2021),
        ..Default::default()
    }
}

pub fn guideline_chunk(chunk_id: &str, section: &str, text: &str) -> GuidelineChunk {
    GuidelineChunk {
        chunk_id: chunk_id.into(),
        text: text.into(),
        section: section.into(),
        page_number: Some(1),
        population_tags: Vec::new(),
    }
}

/// A retrieved chunk from a WHO definitions section with `score` as its
/// fused relevance.
pub fn sample_chunk(chunk_id: &str, text: &str, score: f32, sub_queries: &[usize]) -> RetrievedChunk {
    RetrievedChunk {
        chunk_id: chunk_id.into(),
        document_id: "who-guideline".into(),
        text: text.into(),
        metadata: ChunkMetadata {
            guideline_name: "WHO clinical guideline".into(),
            section: "Definitions".into(),
            section_kind: SectionKind::Definition,
            page_number: Some(1),
            organization: "WHO".into(),
            year: Some(2021),
            population_tags: Vec::new(),
        },
        relevance_score: score,
        rerank_score: None,
        dense_rank: Some(1),
        sparse_rank: None,
        sub_queries: sub_queries.to_vec(),
    }
}

pub fn analysis_for(query: &str, intent: MedicalIntent, entities: &[&str]) -> QueryAnalysis {
    QueryAnalysis {
        query: query.into(),
        intent,
        classification_confidence: 0.8,
        risk_flags: BTreeSet::new(),
        entities: entities.iter().map(|e| e.to_string()).collect(),
        population_hint: None,
        organization_hint: None,
        sub_queries: Vec::new(),
    }
}
