//! Grounded answer synthesis.
//!
//! Builds the intent-specific prompt, calls the completion service, keeps
//! only verbatim citations and scores confidence from the cited evidence.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::config::SynthesisConfig;
use crate::error::{PipelineError, Service, ServiceError};
use crate::llm::{CompletionProvider, GenerationConfig};
use crate::rag::citation_validator::{CitationReport, CitationValidator};
use crate::rag::prompts::build_answer_prompt;
use crate::resilience::{call_with_retry, RetryPolicy};
use crate::types::{Citation, QueryAnalysis, RetrievedChunk};

#[derive(Debug, Clone)]
pub struct SynthesizedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub confidence: f32,
    /// Fraction of factual sentences backed by a citation.
    pub coverage: f32,
    /// Chunks shown to the completion service, in prompt order.
    pub context: Vec<RetrievedChunk>,
}

pub struct AnswerSynthesizer {
    provider: Arc<dyn CompletionProvider>,
    config: SynthesisConfig,
    retry: RetryPolicy,
}

impl AnswerSynthesizer {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: SynthesisConfig, retry: RetryPolicy) -> Self {
        Self {
            provider,
            config,
            retry,
        }
    }

    /// Requires a non-empty chunk list.
    pub async fn synthesize(
        &self,
        analysis: &QueryAnalysis,
        chunks: &[RetrievedChunk],
        cancel: &CancellationToken,
    ) -> Result<SynthesizedAnswer, PipelineError> {
        let context: Vec<RetrievedChunk> = chunks.iter().take(self.config.max_context_chunks.max(1)).cloned().collect();
        let prompt = build_answer_prompt(analysis, &context);
        let generation = GenerationConfig::from(&self.config);

        tracing::debug!(
            provider = self.provider.name(),
            context_chunks = context.len(),
            prompt_len = prompt.len(),
            "Requesting grounded answer"
        );

        let provider = self.provider.clone();
        let answer = call_with_retry(&self.retry, Service::Completion, cancel, || {
            let provider = provider.clone();
            let prompt = prompt.clone();
            let generation = generation.clone();
            async move {
                let text = provider.complete(&prompt, &generation).await?;
                if text.trim().is_empty() {
                    return Err(ServiceError::InvalidResponse("completion service returned an empty answer".into()).into());
                }
                Ok(text)
            }
        })
        .await?;
        let answer = answer.trim().to_string();

        let report = CitationValidator::new(self.config.min_quote_chars).validate(&answer, &context);
        let confidence = self.confidence(analysis, &context, &report);
        let coverage = report.coverage();

        tracing::debug!(
            citations = report.citations.len(),
            rejected = report.rejected_candidates,
            factual_sentences = report.factual_sentences,
            coverage,
            confidence,
            "Answer synthesized"
        );

        Ok(SynthesizedAnswer {
            answer,
            citations: report.into_citations(),
            confidence,
            coverage,
            context,
        })
    }

    /// Weighted mean relevance of cited chunks and sentence coverage, minus a
    /// penalty when some sub-query has no citation. Clamped to [0, 1].
    pub fn confidence(&self, analysis: &QueryAnalysis, context: &[RetrievedChunk], report: &CitationReport) -> f32 {
        let cited = report.cited_chunk_indices();
        let mean_relevance = if cited.is_empty() {
            0.0
        } else {
            cited.iter().map(|&i| context[i].score()).sum::<f32>() / cited.len() as f32
        };

        let mut score = self.config.relevance_weight * mean_relevance + self.config.coverage_weight * report.coverage();

        let answered: BTreeSet<usize> = cited.iter().flat_map(|&i| context[i].sub_queries.iter().copied()).collect();
        let expected = analysis.sub_queries.len().max(1);
        if (0..expected).any(|s| !answered.contains(&s)) {
            score -= self.config.missing_citation_penalty;
        }

        if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        }
    }
}
