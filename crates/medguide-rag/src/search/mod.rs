pub mod hybrid;
pub mod text_search;

pub use hybrid::{max_fused_score, reciprocal_rank_fusion, FusedCandidate, HybridSource, RankKey};
pub use text_search::{PinnedSearcher, TextSearch};

const STOP_WORDS: &[&str] = &[
    "a", "about", "according", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "being", "between", "but", "by", "can", "could", "difference", "do", "does", "for", "from",
    "guidance", "guideline", "guidelines", "had", "has", "have", "how", "i", "in", "is", "it",
    "its", "me", "my", "of", "on", "or", "please", "recommend", "recommended", "should", "tell",
    "that", "the", "their", "there", "this", "to", "was", "were", "what", "when", "where",
    "which", "who", "why", "with", "would", "you", "your",
];

/// Lowercased content terms of `text`: alphanumeric tokens, stop words removed,
/// first occurrence order, no duplicates.
pub fn keyword_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(|w| w.trim_matches('-'))
    {
        if word.len() < 2 || STOP_WORDS.contains(&word) {
            continue;
        }
        if !terms.iter().any(|t| t == word) {
            terms.push(word.to_string());
        }
    }
    terms
}
