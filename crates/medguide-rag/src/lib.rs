//! Medical guideline question answering.
//!
//! Answers questions strictly from ingested clinical guidelines: queries are
//! screened for intent and risk, evidence is retrieved with hybrid dense and
//! lexical search, answers are synthesized with verbatim citations and every
//! answer passes a safety validation before it is returned.
//!
//! The entry point is [`MedicalAssistant`]:
//!
//! ```no_run
//! # async fn run(provider: std::sync::Arc<dyn medguide_rag::llm::CompletionProvider>) -> Result<(), medguide_rag::PipelineError> {
//! use medguide_rag::{AssistantConfig, MedicalAssistant};
//!
//! let assistant = MedicalAssistant::new(AssistantConfig::default(), provider)?;
//! let response = assistant.process_query("What is hypertension according to WHO guidelines?").await;
//! println!("{}", response.answer);
//! # Ok(())
//! # }
//! ```
//!
//! The crate logs through `tracing` and never installs a subscriber. Hosts
//! install one themselves, e.g.
//! `tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))`.

pub mod assistant;
pub mod cancellation;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod indexing;
pub mod llm;
pub mod rag;
pub mod reranking;
pub mod resilience;
pub mod retrieval;
pub mod search;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export primary types for convenience
pub use assistant::{AssistantStats, Collaborators, MedicalAssistant};
pub use cancellation::CancellationToken;
pub use config::AssistantConfig;
pub use error::{PipelineError, Service, ServiceError};
pub use indexing::{GuidelineIndexer, IndexReport};
pub use retrieval::RetrievalEngine;
pub use storage::{GuidelineCorpus, MetadataFilter};
pub use types::{
    ChunkMetadata, Citation, GuidelineChunk, GuidelineMetadata, MedicalIntent, MedicalResponse, PopulationType,
    QueryAnalysis, RefusalReason, ResponseOutcome, RetrievedChunk, RiskFlag, SafetyCheck, SectionKind,
    ViolationCode,
};

// Re-export LLM types
pub use llm::{ApiProvider, CompletionProvider, ExternalProvider, GenerationConfig};
