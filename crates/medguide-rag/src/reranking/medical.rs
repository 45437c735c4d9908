//! Domain reranker for fused guideline candidates.
//!
//! Multiplies the fused relevance by population, organization, section and
//! entity factors. Population is a soft signal: chunks from guidelines with
//! no population restriction are never penalized.

use crate::config::SearchConfig;
use crate::types::{MedicalIntent, PopulationType, QueryAnalysis, RetrievedChunk, SectionKind};

/// Per-factor breakdown of one rerank decision, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankFactors {
    pub population: f32,
    pub organization: f32,
    pub section: f32,
    pub entity: f32,
}

impl RerankFactors {
    pub fn product(&self) -> f32 {
        self.population * self.organization * self.section * self.entity
    }
}

#[derive(Debug, Clone)]
pub struct MedicalReranker {
    population_boost: f32,
    population_mismatch_factor: f32,
    organization_boost: f32,
    actionable_section_boost: f32,
    background_section_factor: f32,
    entity_match_boost: f32,
}

impl MedicalReranker {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            population_boost: config.population_boost,
            population_mismatch_factor: config.population_mismatch_factor,
            organization_boost: config.organization_boost,
            actionable_section_boost: config.actionable_section_boost,
            background_section_factor: config.background_section_factor,
            entity_match_boost: config.entity_match_boost,
        }
    }

    pub fn factors(&self, analysis: &QueryAnalysis, chunk: &RetrievedChunk) -> RerankFactors {
        RerankFactors {
            population: self.population_factor(analysis.population_hint, chunk),
            organization: self.organization_factor(analysis.organization_hint.as_deref(), chunk),
            section: self.section_factor(analysis.intent, chunk.metadata.section_kind),
            entity: self.entity_factor(&analysis.entities, &chunk.text),
        }
    }

    /// Rerank score in [0, 1].
    pub fn score(&self, analysis: &QueryAnalysis, chunk: &RetrievedChunk) -> f32 {
        let score = chunk.relevance_score * self.factors(analysis, chunk).product();
        if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        }
    }

    /// Attach rerank scores and return the chunks in total rank order.
    pub fn rerank(&self, analysis: &QueryAnalysis, chunks: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
        let mut reranked: Vec<RetrievedChunk> = chunks
            .into_iter()
            .map(|mut chunk| {
                chunk.rerank_score = Some(self.score(analysis, &chunk));
                chunk
            })
            .collect();
        reranked.sort_by(|a, b| a.rank_key().compare(&b.rank_key()));
        reranked
    }

    fn population_factor(&self, hint: Option<PopulationType>, chunk: &RetrievedChunk) -> f32 {
        let Some(hint) = hint.filter(|h| *h != PopulationType::General) else {
            return 1.0;
        };
        if chunk.metadata.is_population_neutral() {
            1.0
        } else if chunk.metadata.population_tags.contains(&hint) {
            self.population_boost
        } else {
            self.population_mismatch_factor
        }
    }

    fn organization_factor(&self, hint: Option<&str>, chunk: &RetrievedChunk) -> f32 {
        let Some(org) = hint else {
            return 1.0;
        };
        let meta = &chunk.metadata;
        let named_in_title = meta
            .guideline_name
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == org);
        if meta.organization.eq_ignore_ascii_case(org) || named_in_title {
            self.organization_boost
        } else {
            1.0
        }
    }

    fn section_factor(&self, intent: MedicalIntent, kind: SectionKind) -> f32 {
        if kind.is_actionable() || (intent == MedicalIntent::Definition && kind == SectionKind::Definition) {
            self.actionable_section_boost
        } else if kind.is_background() {
            self.background_section_factor
        } else {
            1.0
        }
    }

    fn entity_factor(&self, entities: &[String], text: &str) -> f32 {
        if entities.is_empty() {
            return 1.0;
        }
        let lower = text.to_lowercase();
        let matched = entities.iter().filter(|e| lower.contains(e.as_str())).count();
        1.0 + self.entity_match_boost * matched as f32 / entities.len() as f32
    }
}
