use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Directory for the lexical index files. The index lives in RAM when
    /// absent. Vectors and the document store are always in memory, so the
    /// directory is emptied at startup and guidelines must be re-ingested.
    pub index_dir: Option<PathBuf>,
    pub search: SearchConfig,
    pub synthesis: SynthesisConfig,
    pub safety: SafetyConfig,
    pub embedding: EmbeddingConfig,
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub k_dense: usize,
    pub k_sparse: usize,
    /// RRF constant `c`.
    pub rrf_k: usize,
    /// How many fused candidates go through medical reranking.
    pub rerank_candidates: usize,
    pub rerank_top_k: usize,
    /// Cap on merged results across sub-queries.
    pub max_results: usize,
    pub min_dense_similarity: f32,
    pub relevance_floor: f32,
    pub population_boost: f32,
    pub population_mismatch_factor: f32,
    pub organization_boost: f32,
    pub actionable_section_boost: f32,
    pub background_section_factor: f32,
    pub entity_match_boost: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub relevance_weight: f32,
    pub coverage_weight: f32,
    pub missing_citation_penalty: f32,
    /// Quotes shorter than this are not treated as citations.
    pub min_quote_chars: usize,
    pub max_context_chunks: usize,
    pub max_tokens: usize,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub low_confidence_threshold: f32,
    pub min_answer_confidence: f32,
    pub educational_disclaimer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub dimension: usize,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f32,
    pub max_backoff_ms: u64,
}

impl AssistantConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        let s = &self.search;
        if s.k_dense == 0 && s.k_sparse == 0 {
            return Err("search.k_dense and search.k_sparse cannot both be 0".into());
        }
        if s.rrf_k == 0 {
            return Err("search.rrf_k must be > 0".into());
        }
        if s.rerank_candidates == 0 {
            return Err("search.rerank_candidates must be > 0".into());
        }
        if s.rerank_top_k == 0 {
            return Err("search.rerank_top_k must be > 0".into());
        }
        if s.max_results == 0 {
            return Err("search.max_results must be > 0".into());
        }
        if !(-1.0..=1.0).contains(&s.min_dense_similarity) {
            return Err("search.min_dense_similarity must be in [-1.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&s.relevance_floor) {
            return Err("search.relevance_floor must be in [0.0, 1.0]".into());
        }
        for (name, factor) in [
            ("search.population_boost", s.population_boost),
            ("search.population_mismatch_factor", s.population_mismatch_factor),
            ("search.organization_boost", s.organization_boost),
            ("search.actionable_section_boost", s.actionable_section_boost),
            ("search.background_section_factor", s.background_section_factor),
            ("search.entity_match_boost", s.entity_match_boost),
        ] {
            if !factor.is_finite() || factor < 0.0 {
                return Err(format!("{} must be a finite value >= 0.0", name));
            }
        }

        let syn = &self.synthesis;
        if !(0.0..=1.0).contains(&syn.relevance_weight) || !(0.0..=1.0).contains(&syn.coverage_weight) {
            return Err("synthesis weights must be in [0.0, 1.0]".into());
        }
        if syn.relevance_weight + syn.coverage_weight <= 0.0 {
            return Err("synthesis.relevance_weight + synthesis.coverage_weight must be > 0".into());
        }
        if !(0.0..=1.0).contains(&syn.missing_citation_penalty) {
            return Err("synthesis.missing_citation_penalty must be in [0.0, 1.0]".into());
        }
        if syn.min_quote_chars == 0 {
            return Err("synthesis.min_quote_chars must be > 0".into());
        }
        if syn.max_context_chunks == 0 {
            return Err("synthesis.max_context_chunks must be > 0".into());
        }
        if syn.max_tokens == 0 {
            return Err("synthesis.max_tokens must be > 0".into());
        }

        if !(0.0..=1.0).contains(&self.safety.low_confidence_threshold) {
            return Err("safety.low_confidence_threshold must be in [0.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&self.safety.min_answer_confidence) {
            return Err("safety.min_answer_confidence must be in [0.0, 1.0]".into());
        }

        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }

        let r = &self.resilience;
        if r.timeout_ms == 0 {
            return Err("resilience.timeout_ms must be > 0".into());
        }
        if r.backoff_multiplier < 1.0 {
            return Err("resilience.backoff_multiplier must be >= 1.0".into());
        }
        if r.max_backoff_ms < r.initial_backoff_ms {
            return Err("resilience.max_backoff_ms must be >= initial_backoff_ms".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override selected values from `MEDGUIDE_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), String> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T, String> {
            raw.trim()
                .parse()
                .map_err(|_| format!("{} has an invalid value: {}", key, raw))
        }

        if let Some(v) = lookup("MEDGUIDE_RERANK_TOP_K") {
            self.search.rerank_top_k = parse("MEDGUIDE_RERANK_TOP_K", v)?;
        }
        if let Some(v) = lookup("MEDGUIDE_MAX_RESULTS") {
            self.search.max_results = parse("MEDGUIDE_MAX_RESULTS", v)?;
        }
        if let Some(v) = lookup("MEDGUIDE_RELEVANCE_FLOOR") {
            self.search.relevance_floor = parse("MEDGUIDE_RELEVANCE_FLOOR", v)?;
        }
        if let Some(v) = lookup("MEDGUIDE_TIMEOUT_MS") {
            self.resilience.timeout_ms = parse("MEDGUIDE_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("MEDGUIDE_MAX_RETRIES") {
            self.resilience.max_retries = parse("MEDGUIDE_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("MEDGUIDE_EDUCATIONAL_DISCLAIMER") {
            self.safety.educational_disclaimer = parse("MEDGUIDE_EDUCATIONAL_DISCLAIMER", v)?;
        }
        if let Some(v) = lookup("MEDGUIDE_INDEX_DIR") {
            self.index_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Default directory for on-disk lexical index files.
    pub fn default_index_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("medguide-rag")
            .join("lexical-index")
    }

    /// Keep lexical index files in the platform data directory instead of RAM.
    pub fn with_persistent_index(mut self) -> Self {
        self.index_dir = Some(Self::default_index_dir());
        self
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            index_dir: None,
            search: SearchConfig::default(),
            synthesis: SynthesisConfig::default(),
            safety: SafetyConfig::default(),
            embedding: EmbeddingConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k_dense: 20,
            k_sparse: 20,
            rrf_k: 60,
            rerank_candidates: 20,
            rerank_top_k: 5,
            max_results: 10,
            min_dense_similarity: 0.05,
            relevance_floor: 0.1,
            population_boost: 1.2,
            population_mismatch_factor: 0.85,
            organization_boost: 1.15,
            actionable_section_boost: 1.15,
            background_section_factor: 0.85,
            entity_match_boost: 0.2,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            relevance_weight: 0.4,
            coverage_weight: 0.6,
            missing_citation_penalty: 0.2,
            min_quote_chars: 12,
            max_context_chunks: 5,
            max_tokens: 512,
            temperature: 0.1,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            low_confidence_threshold: 0.35,
            min_answer_confidence: 0.6,
            educational_disclaimer: true,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            cache_size: 1000,
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 2,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 2_000,
        }
    }
}
