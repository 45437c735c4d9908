//! Query Decomposition Module
//!
//! Splits complex multi-part medical questions into independent sub-queries
//! that are retrieved separately and merged. Handles enumerated items,
//! multiple question marks, comparative queries and conjunctions.

use std::sync::LazyLock;

use crate::search::keyword_terms;

static CONJUNCTION_SPLIT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(?:and also|and then|as well as|and|or|also|additionally|plus)\b")
        .expect("conjunction regex is valid")
});

static QUESTION_MARK_SPLIT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\?\s+").expect("question mark split regex is valid")
});

static ENUMERATED_MARKER_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)(?:^|\s)(?:\d+[.)]|[-•])\s+").expect("enumerated regex is valid")
});

static COMPARATIVE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(?:compare|difference between|differences between|versus|vs\.?|differ from)\b")
        .expect("comparative regex is valid")
});

static BETWEEN_ENTITIES_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)between\s+(.+?)\s+and\s+(.+?)(?:\s+(?:in|for|during|among)\b|\?|$)")
        .expect("between entities regex is valid")
});

/// Fixed medical phrases that contain a conjunction but name a single topic.
const NON_SPLIT_PHRASES: &[&str] = &[
    "signs and symptoms",
    "risks and benefits",
    "benefits and risks",
    "pros and cons",
    "advantages and disadvantages",
    "diagnosis and treatment",
    "diagnosis and management",
    "prevention and treatment",
    "prevention and control",
    "screening and diagnosis",
    "care and treatment",
    "care and support",
    "nausea and vomiting",
    "diet and exercise",
    "sexual and reproductive",
    "maternal and child",
    "mother and child",
    "hiv and aids",
    "dose and duration",
    "safety and efficacy",
    "efficacy and safety",
];

/// Result of query decomposition.
#[derive(Debug, Clone)]
pub struct DecomposedQuery {
    pub original: String,
    /// Empty when the query is atomic.
    pub sub_queries: Vec<String>,
    pub strategy: DecompositionStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompositionStrategy {
    /// Query was not decomposed (single intent)
    Single,
    /// Split on conjunctions ("X and Y")
    Conjunction,
    /// Split on multiple question marks
    MultiQuestion,
    /// Enumerated items ("1. X 2. Y")
    Enumerated,
    /// Comparative query decomposed into per-entity searches
    Comparative,
}

/// Decompose a complex query into sub-queries for independent retrieval.
///
/// Atomic queries come back with an empty `sub_queries` list.
pub fn decompose_query(query: &str) -> DecomposedQuery {
    let query = query.trim();

    // Short queries are never decomposed
    if query.split_whitespace().count() < 5 {
        return single(query);
    }

    // 1. Enumerated items: "1. what is X  2. what is Y"
    let enumerated = extract_enumerated(query);
    if enumerated.len() >= 2 {
        return decomposed(query, enumerated, DecompositionStrategy::Enumerated);
    }

    // 2. Multiple question marks: "What is X? What about Y?"
    let questions = split_on_question_marks(query);
    if questions.len() >= 2 {
        return decomposed(query, questions, DecompositionStrategy::MultiQuestion);
    }

    // 3. Comparative: "difference between X and Y"
    if let Some(comparative) = try_comparative_split(query) {
        return comparative;
    }

    // 4. Conjunction split, only when every part stands alone
    if let Some(conjunction) = try_conjunction_split(query) {
        return conjunction;
    }

    single(query)
}

fn single(query: &str) -> DecomposedQuery {
    DecomposedQuery {
        original: query.to_string(),
        sub_queries: Vec::new(),
        strategy: DecompositionStrategy::Single,
    }
}

fn decomposed(query: &str, parts: Vec<String>, strategy: DecompositionStrategy) -> DecomposedQuery {
    let mut sub_queries: Vec<String> = Vec::with_capacity(parts.len());
    for part in parts {
        if !sub_queries.iter().any(|q| q.eq_ignore_ascii_case(&part)) {
            sub_queries.push(part);
        }
    }
    if sub_queries.len() < 2 {
        return single(query);
    }
    DecomposedQuery {
        original: query.to_string(),
        sub_queries,
        strategy,
    }
}

fn is_standalone(part: &str) -> bool {
    part.split_whitespace().count() >= 3 && !keyword_terms(part).is_empty()
}

fn extract_enumerated(query: &str) -> Vec<String> {
    if ENUMERATED_MARKER_RE.find_iter(query).count() < 2 {
        return Vec::new();
    }
    ENUMERATED_MARKER_RE
        .split(query)
        .map(|s| s.trim().to_string())
        .filter(|s| s.split_whitespace().count() >= 2 && !keyword_terms(s).is_empty())
        .collect()
}

fn split_on_question_marks(query: &str) -> Vec<String> {
    QUESTION_MARK_SPLIT_RE
        .split(query)
        .map(|s| {
            let s = s.trim();
            if s.ends_with('?') || s.is_empty() {
                s.to_string()
            } else {
                format!("{}?", s)
            }
        })
        .filter(|s| s.split_whitespace().count() >= 2 && !keyword_terms(s).is_empty())
        .collect()
}

fn try_comparative_split(query: &str) -> Option<DecomposedQuery> {
    if !COMPARATIVE_RE.is_match(query) {
        return None;
    }

    let cap = BETWEEN_ENTITIES_RE.captures(query)?;
    let entity_a = cap.get(1)?.as_str().trim().trim_end_matches('?').to_string();
    let entity_b = cap.get(2)?.as_str().trim().trim_end_matches('?').to_string();

    if entity_a.is_empty()
        || entity_b.is_empty()
        || entity_a.split_whitespace().count() > 5
        || entity_b.split_whitespace().count() > 5
    {
        return None;
    }

    Some(decomposed(
        query,
        vec![
            format!("what is {}", entity_a),
            format!("what is {}", entity_b),
            // Keep the original for passages that compare the two directly
            query.to_string(),
        ],
        DecompositionStrategy::Comparative,
    ))
}

fn try_conjunction_split(query: &str) -> Option<DecomposedQuery> {
    let lower = query.to_lowercase();
    if NON_SPLIT_PHRASES.iter().any(|p| lower.contains(p)) {
        return None;
    }

    let parts: Vec<String> = CONJUNCTION_SPLIT_RE
        .split(query)
        .map(|p| p.trim().trim_matches(',').trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() < 2 || !parts.iter().all(|p| is_standalone(p)) {
        return None;
    }

    Some(decomposed(query, parts, DecompositionStrategy::Conjunction))
}
