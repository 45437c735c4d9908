use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::search::RankKey;

static RECOMMENDATION_SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(recommendations?|guidelines?|treatment|management|therapy)\b")
        .expect("recommendation section regex is valid")
});
static PROCEDURE_SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(procedures?|technique|protocol|steps|how to|administration)\b")
        .expect("procedure section regex is valid")
});
static CONTRAINDICATION_SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(contraindications?|warnings?|precautions?|adverse|side effects?)\b")
        .expect("contraindication section regex is valid")
});
static DOSAGE_SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(dosage|dosing|doses?|posology)\b").expect("dosage section regex is valid")
});
static DEFINITION_SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(definitions?|glossary|terminology|classification|diagnostic criteria)\b")
        .expect("definition section regex is valid")
});
static MONITORING_SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(monitoring|follow-up|surveillance)\b").expect("monitoring section regex is valid")
});
static BACKGROUND_SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(introduction|background|overview|foreword|preface|acknowledg\w*|methods?|scope)\b")
        .expect("background section regex is valid")
});
static COMMENTARY_SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(commentary|discussion|remarks|rationale|evidence review|references)\b")
        .expect("commentary section regex is valid")
});

/// Closed set of query intents, in classification priority order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MedicalIntent {
    Emergency,
    DiagnosisRequest,
    TreatmentAdviceRequest,
    Definition,
    Recommendation,
    Contraindication,
    Procedure,
    Conversational,
    UnsafeOther,
}

impl MedicalIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::DiagnosisRequest => "diagnosis_request",
            Self::TreatmentAdviceRequest => "treatment_advice_request",
            Self::Definition => "definition",
            Self::Recommendation => "recommendation",
            Self::Contraindication => "contraindication",
            Self::Procedure => "procedure",
            Self::Conversational => "conversational",
            Self::UnsafeOther => "unsafe_other",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label
            .trim()
            .trim_matches(|c: char| !c.is_ascii_alphabetic() && c != '_')
            .to_ascii_lowercase()
            .replace([' ', '-'], "_");
        match normalized.as_str() {
            "emergency" => Some(Self::Emergency),
            "diagnosis_request" | "diagnosis" => Some(Self::DiagnosisRequest),
            "treatment_advice_request" | "treatment_advice" | "treatment" => {
                Some(Self::TreatmentAdviceRequest)
            }
            "definition" => Some(Self::Definition),
            "recommendation" => Some(Self::Recommendation),
            "contraindication" => Some(Self::Contraindication),
            "procedure" => Some(Self::Procedure),
            "conversational" => Some(Self::Conversational),
            "unsafe_other" | "unsafe" => Some(Self::UnsafeOther),
            _ => None,
        }
    }

    /// Intents that are refused before any retrieval or completion call.
    pub fn is_refused_outright(&self) -> bool {
        matches!(
            self,
            Self::Emergency | Self::DiagnosisRequest | Self::TreatmentAdviceRequest | Self::UnsafeOther
        )
    }

    /// Educational medical intents answered from guideline evidence.
    pub fn is_educational(&self) -> bool {
        matches!(
            self,
            Self::Definition | Self::Recommendation | Self::Contraindication | Self::Procedure
        )
    }
}

/// Risk patterns detected independently of the intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    EmergencyLanguage,
    SelfHarm,
    SelfDiagnosis,
    PersonalTreatment,
    PersonalDosage,
    PopulationSpecific,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PopulationType {
    Adult,
    Pediatric,
    Geriatric,
    Pregnant,
    General,
}

impl PopulationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adult => "adult",
            Self::Pediatric => "pediatric",
            Self::Geriatric => "geriatric",
            Self::Pregnant => "pregnant",
            Self::General => "general",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "adult" | "adults" => Some(Self::Adult),
            "pediatric" | "paediatric" | "child" | "children" => Some(Self::Pediatric),
            "geriatric" | "elderly" | "older adult" | "older adults" => Some(Self::Geriatric),
            "pregnant" | "pregnancy" | "maternal" => Some(Self::Pregnant),
            "general" | "all" => Some(Self::General),
            _ => None,
        }
    }
}

/// Coarse role of a guideline section, used by the medical reranker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Recommendation,
    Procedure,
    Contraindication,
    Dosage,
    Definition,
    Monitoring,
    Background,
    Commentary,
    Other,
}

impl SectionKind {
    /// Derive the section role from its heading. Background and commentary
    /// headings win over the actionable ones ("Background to the recommendations").
    pub fn from_section_name(section: &str) -> Self {
        if BACKGROUND_SECTION_RE.is_match(section) {
            Self::Background
        } else if COMMENTARY_SECTION_RE.is_match(section) {
            Self::Commentary
        } else if CONTRAINDICATION_SECTION_RE.is_match(section) {
            Self::Contraindication
        } else if DOSAGE_SECTION_RE.is_match(section) {
            Self::Dosage
        } else if PROCEDURE_SECTION_RE.is_match(section) {
            Self::Procedure
        } else if RECOMMENDATION_SECTION_RE.is_match(section) {
            Self::Recommendation
        } else if DEFINITION_SECTION_RE.is_match(section) {
            Self::Definition
        } else if MONITORING_SECTION_RE.is_match(section) {
            Self::Monitoring
        } else {
            Self::Other
        }
    }

    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            Self::Recommendation | Self::Procedure | Self::Contraindication | Self::Dosage
        )
    }

    pub fn is_background(&self) -> bool {
        matches!(self, Self::Background | Self::Commentary)
    }
}

/// Result of query analysis. Built once per request, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryAnalysis {
    pub query: String,
    pub intent: MedicalIntent,
    /// How sure the classifier is; the ambiguous default is low.
    pub classification_confidence: f32,
    pub risk_flags: BTreeSet<RiskFlag>,
    pub entities: Vec<String>,
    pub population_hint: Option<PopulationType>,
    /// Guideline body named in the query ("according to WHO").
    pub organization_hint: Option<String>,
    /// Empty when the query is atomic.
    pub sub_queries: Vec<String>,
}

impl QueryAnalysis {
    /// The texts the retrieval engine searches for: the sub-queries, or the
    /// query itself when it was not decomposed.
    pub fn retrieval_queries(&self) -> Vec<&str> {
        if self.sub_queries.is_empty() {
            vec![self.query.as_str()]
        } else {
            self.sub_queries.iter().map(String::as_str).collect()
        }
    }
}

/// Document-level metadata produced at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GuidelineMetadata {
    pub document_id: String,
    pub title: String,
    pub organization: String,
    pub year: Option<i32>,
    /// Populations the guideline is restricted to. Empty means unrestricted.
    #[serde(default)]
    pub populations: Vec<PopulationType>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
}

/// A chunk as handed over by the document parser for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuidelineChunk {
    pub chunk_id: String,
    pub text: String,
    pub section: String,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub population_tags: Vec<PopulationType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub guideline_name: String,
    pub section: String,
    pub section_kind: SectionKind,
    pub page_number: Option<u32>,
    pub organization: String,
    pub year: Option<i32>,
    pub population_tags: Vec<PopulationType>,
}

impl ChunkMetadata {
    pub fn from_guideline(guideline: &GuidelineMetadata, chunk: &GuidelineChunk) -> Self {
        let mut population_tags = chunk.population_tags.clone();
        for population in &guideline.populations {
            if !population_tags.contains(population) {
                population_tags.push(*population);
            }
        }
        population_tags.sort();

        Self {
            guideline_name: guideline.title.clone(),
            section: chunk.section.clone(),
            section_kind: SectionKind::from_section_name(&chunk.section),
            page_number: chunk.page_number,
            organization: guideline.organization.clone(),
            year: guideline.year,
            population_tags,
        }
    }

    /// True when the chunk carries no population restriction.
    pub fn is_population_neutral(&self) -> bool {
        self.population_tags.is_empty() || self.population_tags.contains(&PopulationType::General)
    }
}

/// A chunk surfaced by retrieval for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Normalized fusion score in [0, 1].
    pub relevance_score: f32,
    /// Score after medical reranking; absent before reranking.
    pub rerank_score: Option<f32>,
    /// 1-based rank in the dense ranking, if present there.
    pub dense_rank: Option<usize>,
    /// 1-based rank in the lexical ranking, if present there.
    pub sparse_rank: Option<usize>,
    /// Indices of the sub-queries this chunk answers.
    pub sub_queries: Vec<usize>,
}

impl RetrievedChunk {
    /// The ranking signal of the latest stage this chunk went through.
    pub fn score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.relevance_score)
    }

    pub fn rank_key(&self) -> RankKey<'_> {
        RankKey {
            score: self.score(),
            dense_rank: self.dense_rank,
            sparse_rank: self.sparse_rank,
            chunk_id: &self.chunk_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub guideline_name: String,
    pub section: String,
    pub page_number: Option<u32>,
    pub organization: String,
    pub year: Option<i32>,
    /// Verbatim substring of the text of the chunk named by `chunk_id`.
    pub quote: String,
    pub chunk_id: String,
}

impl Citation {
    pub fn from_chunk(chunk: &RetrievedChunk, quote: String) -> Self {
        Self {
            guideline_name: chunk.metadata.guideline_name.clone(),
            section: chunk.metadata.section.clone(),
            page_number: chunk.metadata.page_number,
            organization: chunk.metadata.organization.clone(),
            year: chunk.metadata.year,
            quote,
            chunk_id: chunk.chunk_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    EmergencyQuery,
    DiagnosisRequest,
    TreatmentAdviceRequest,
    UnsafeQuery,
    DirectiveLanguage,
    UngroundedClaim,
    OverconfidentLanguage,
    SystemError,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    Emergency,
    DiagnosisRequest,
    TreatmentAdviceRequest,
    UnsafeQuery,
    UngroundedOrDirective,
}

impl RefusalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::DiagnosisRequest => "diagnosis_request",
            Self::TreatmentAdviceRequest => "treatment_advice_request",
            Self::UnsafeQuery => "unsafe_query",
            Self::UngroundedOrDirective => "ungrounded_or_directive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyCheck {
    pub is_safe: bool,
    pub violations: Vec<ViolationCode>,
    pub requires_disclaimer: bool,
    pub refusal_reason: Option<RefusalReason>,
}

impl SafetyCheck {
    pub fn safe(requires_disclaimer: bool) -> Self {
        Self {
            is_safe: true,
            violations: Vec::new(),
            requires_disclaimer,
            refusal_reason: None,
        }
    }

    pub fn refused(reason: RefusalReason, violations: Vec<ViolationCode>) -> Self {
        Self {
            is_safe: false,
            violations,
            requires_disclaimer: true,
            refusal_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    Answered,
    Refused,
    Conversational,
    InsufficientEvidence,
    SystemError,
}

/// The single output artifact of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicalResponse {
    pub query: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub confidence_score: f32,
    pub safety_check: SafetyCheck,
    pub disclaimer: String,
    pub outcome: ResponseOutcome,
    pub retrieved_chunks: Vec<RetrievedChunk>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_kind_detection() {
        assert_eq!(SectionKind::from_section_name("Recommendations"), SectionKind::Recommendation);
        assert_eq!(SectionKind::from_section_name("4.2 Contraindications"), SectionKind::Contraindication);
        assert_eq!(SectionKind::from_section_name("Dosage and administration"), SectionKind::Dosage);
        assert_eq!(SectionKind::from_section_name("Background"), SectionKind::Background);
        assert_eq!(
            SectionKind::from_section_name("Background to the recommendations"),
            SectionKind::Background
        );
        assert_eq!(SectionKind::from_section_name("Definitions"), SectionKind::Definition);
        assert_eq!(SectionKind::from_section_name("page_12"), SectionKind::Other);
    }

    #[test]
    fn test_intent_labels_roundtrip_through_wire_names() {
        for intent in [
            MedicalIntent::Emergency,
            MedicalIntent::DiagnosisRequest,
            MedicalIntent::TreatmentAdviceRequest,
            MedicalIntent::Definition,
            MedicalIntent::Recommendation,
            MedicalIntent::Contraindication,
            MedicalIntent::Procedure,
            MedicalIntent::Conversational,
            MedicalIntent::UnsafeOther,
        ] {
            let wire = serde_json::to_string(&intent).unwrap();
            assert_eq!(wire, format!("\"{}\"", intent.as_str()));
            assert_eq!(MedicalIntent::from_label(intent.as_str()), Some(intent));
        }
        assert_eq!(MedicalIntent::from_label("  Definition. "), Some(MedicalIntent::Definition));
        assert_eq!(MedicalIntent::from_label("banana"), None);
    }

    #[test]
    fn test_chunk_metadata_merges_guideline_populations() {
        let guideline = GuidelineMetadata {
            document_id: "who-anc".into(),
            title: "WHO antenatal care".into(),
            organization: "WHO".into(),
            year: Some(2016),
            populations: vec![PopulationType::Pregnant],
            ..Default::default()
        };
        let chunk = GuidelineChunk {
            chunk_id: "c1".into(),
            text: "Iron supplementation is recommended.".into(),
            section: "Recommendations".into(),
            page_number: Some(4),
            population_tags: vec![],
        };
        let meta = ChunkMetadata::from_guideline(&guideline, &chunk);
        assert_eq!(meta.population_tags, vec![PopulationType::Pregnant]);
        assert!(!meta.is_population_neutral());
        assert_eq!(meta.section_kind, SectionKind::Recommendation);
    }

    #[test]
    fn test_atomic_query_retrieves_itself() {
        let analysis = QueryAnalysis {
            query: "What is hypertension?".into(),
            intent: MedicalIntent::Definition,
            classification_confidence: 0.9,
            risk_flags: BTreeSet::new(),
            entities: vec!["hypertension".into()],
            population_hint: None,
            organization_hint: None,
            sub_queries: vec![],
        };
        assert_eq!(analysis.retrieval_queries(), vec!["What is hypertension?"]);
    }
}
