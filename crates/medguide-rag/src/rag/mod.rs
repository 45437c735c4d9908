//! Query understanding, grounded synthesis and safety validation.

pub mod citation_validator;
pub mod prompts;
pub mod query_analyzer;
pub mod query_decomposer;
pub mod safety;
pub mod synthesizer;

pub use citation_validator::{extract_citations, is_verbatim, CitationReport, CitationValidator};
pub use query_analyzer::{
    Classification, ModelBackedClassifier, QueryAnalyzer, QueryClassifier, RuleBasedClassifier, SUPPORTED_SOURCES,
};
pub use query_decomposer::{decompose_query, DecomposedQuery, DecompositionStrategy};
pub use safety::{refusal_message, SafetyValidator, EDUCATIONAL_DISCLAIMER};
pub use synthesizer::{AnswerSynthesizer, SynthesizedAnswer};
