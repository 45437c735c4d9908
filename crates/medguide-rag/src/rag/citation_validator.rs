//! Citation Validation Module
//!
//! Extracts quoted and near-quoted spans from a generated answer and keeps
//! only those that occur verbatim in one of the supplied chunks. Matching is
//! tolerant of case, whitespace, typographic quotes and trailing ellipses,
//! but every accepted quote is sliced out of the chunk text itself, so it is
//! always a literal substring of the chunk it cites.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::types::{Citation, RetrievedChunk};

static QUOTED_SPAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:"([^"\n]+)"|“([^”\n]+)”)(?:\s*\[(?:source\s*)?(\d+)\])?"#).expect("quoted span regex is valid")
});

static SOURCE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[(?:source\s*)?(\d+)\]").expect("source marker regex is valid"));

static SENTENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)[.!?]["”’)]?(?:\s*\[(?:source\s*)?\d+\])*(?:\s+|$)|\n+"#).expect("sentence end regex is valid")
});

/// Openers of sentences that talk about the evidence instead of stating a fact.
const NON_FACTUAL_PREFIXES: &[&str] = &[
    "i could not",
    "i cannot",
    "i can't",
    "i don't",
    "i do not",
    "the provided sources do not",
    "the provided guidelines do not",
    "the sources do not",
    "the guidelines do not",
    "the available guidelines do not",
    "there is no information",
    "please consult",
    "consult a",
    "this information is",
    "note:",
];

/// A validated citation plus where it came from.
#[derive(Debug, Clone)]
pub struct ExtractedCitation {
    pub citation: Citation,
    /// Index of the cited chunk in the supplied chunk list.
    pub chunk_index: usize,
    /// Index of the answer sentence the quote starts in.
    pub sentence_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CitationReport {
    pub citations: Vec<ExtractedCitation>,
    pub factual_sentences: usize,
    pub supported_sentences: usize,
    /// Candidates that matched no chunk.
    pub rejected_candidates: usize,
}

impl CitationReport {
    /// Fraction of factual sentences backed by at least one citation.
    pub fn coverage(&self) -> f32 {
        if self.factual_sentences == 0 {
            0.0
        } else {
            self.supported_sentences as f32 / self.factual_sentences as f32
        }
    }

    pub fn cited_chunk_indices(&self) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.citations
            .iter()
            .map(|c| c.chunk_index)
            .filter(|i| seen.insert(*i))
            .collect()
    }

    pub fn into_citations(self) -> Vec<Citation> {
        self.citations.into_iter().map(|c| c.citation).collect()
    }
}

/// Citation validator for generated answers
pub struct CitationValidator {
    min_quote_chars: usize,
}

impl CitationValidator {
    pub fn new(min_quote_chars: usize) -> Self {
        Self { min_quote_chars }
    }

    /// Extract and verify all citations in `answer` against `chunks`.
    pub fn validate(&self, answer: &str, chunks: &[RetrievedChunk]) -> CitationReport {
        let sentences = sentence_spans(answer);
        let normalized_chunks: Vec<NormalizedText> = chunks.iter().map(|c| NormalizedText::new(&c.text)).collect();

        let mut report = CitationReport::default();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut supported: HashSet<usize> = HashSet::new();
        let mut quoted_sentences: HashSet<usize> = HashSet::new();

        // Pass 1: explicitly quoted spans
        for cap in QUOTED_SPAN_RE.captures_iter(answer) {
            let Some(quote) = cap.get(1).or_else(|| cap.get(2)) else {
                continue;
            };
            let marker = cap.get(3).and_then(|m| m.as_str().parse::<usize>().ok());
            let sentence_index = sentence_index_at(&sentences, quote.start());
            quoted_sentences.insert(sentence_index);

            match self.match_quote(quote.as_str(), marker, chunks, &normalized_chunks) {
                Some((chunk_index, literal)) => {
                    supported.insert(sentence_index);
                    push_citation(&mut report, &mut seen, chunks, chunk_index, literal, sentence_index);
                }
                None => {
                    report.rejected_candidates += 1;
                    tracing::debug!(quote_len = quote.as_str().len(), "Discarding quote not found in any chunk");
                }
            }
        }

        // Pass 2: unquoted sentences carrying a source marker are near-quotes
        // of the marked chunk
        for (sentence_index, &(start, end)) in sentences.iter().enumerate() {
            if quoted_sentences.contains(&sentence_index) {
                continue;
            }
            let sentence = &answer[start..end];
            let markers: Vec<usize> = SOURCE_MARKER_RE
                .captures_iter(sentence)
                .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<usize>().ok()))
                .collect();
            if markers.is_empty() {
                continue;
            }
            let stripped = SOURCE_MARKER_RE.replace_all(sentence, "");
            for marker in markers {
                let Some(chunk_index) = marker.checked_sub(1).filter(|i| *i < chunks.len()) else {
                    continue;
                };
                if let Some(literal) = self.match_in_chunk(&stripped, &chunks[chunk_index].text, &normalized_chunks[chunk_index]) {
                    supported.insert(sentence_index);
                    push_citation(&mut report, &mut seen, chunks, chunk_index, literal, sentence_index);
                    break;
                }
            }
        }

        for (sentence_index, &(start, end)) in sentences.iter().enumerate() {
            if is_factual_sentence(&answer[start..end]) {
                report.factual_sentences += 1;
                if supported.contains(&sentence_index) {
                    report.supported_sentences += 1;
                }
            }
        }

        report.citations.sort_by_key(|c| c.sentence_index);
        report
    }

    /// Marked chunk first, then every chunk in rank order.
    fn match_quote(
        &self,
        quote: &str,
        marker: Option<usize>,
        chunks: &[RetrievedChunk],
        normalized: &[NormalizedText],
    ) -> Option<(usize, String)> {
        let marked = marker.and_then(|m| m.checked_sub(1)).filter(|i| *i < chunks.len());
        if let Some(i) = marked {
            if let Some(literal) = self.match_in_chunk(quote, &chunks[i].text, &normalized[i]) {
                return Some((i, literal));
            }
        }
        (0..chunks.len())
            .filter(|i| Some(*i) != marked)
            .find_map(|i| self.match_in_chunk(quote, &chunks[i].text, &normalized[i]).map(|l| (i, l)))
    }

    fn match_in_chunk(&self, candidate: &str, chunk_text: &str, normalized_chunk: &NormalizedText) -> Option<String> {
        let needle = NormalizedText::new(trim_quote(candidate)).text;
        if needle.chars().count() < self.min_quote_chars {
            return None;
        }
        let start = normalized_chunk.text.find(&needle)?;
        let (from, to) = normalized_chunk.original_range(start, needle.len())?;
        chunk_text.get(from..to).map(str::to_string)
    }
}

/// Pure convenience wrapper returning only the verified citations.
pub fn extract_citations(answer: &str, chunks: &[RetrievedChunk], min_quote_chars: usize) -> Vec<Citation> {
    CitationValidator::new(min_quote_chars).validate(answer, chunks).into_citations()
}

/// True when the citation's quote is a literal substring of the chunk it names.
pub fn is_verbatim(citation: &Citation, chunks: &[RetrievedChunk]) -> bool {
    !citation.quote.is_empty()
        && chunks
            .iter()
            .any(|c| c.chunk_id == citation.chunk_id && c.text.contains(&citation.quote))
}

fn push_citation(
    report: &mut CitationReport,
    seen: &mut HashSet<(String, String)>,
    chunks: &[RetrievedChunk],
    chunk_index: usize,
    literal: String,
    sentence_index: usize,
) {
    let chunk = &chunks[chunk_index];
    if !seen.insert((chunk.chunk_id.clone(), literal.clone())) {
        return;
    }
    report.citations.push(ExtractedCitation {
        citation: Citation::from_chunk(chunk, literal),
        chunk_index,
        sentence_index,
    });
}

/// Strip ellipses, surrounding whitespace and trailing clause punctuation.
fn trim_quote(quote: &str) -> &str {
    quote
        .trim()
        .trim_start_matches(|c: char| c == '.' || c == '…' || c.is_whitespace())
        .trim_end_matches(|c: char| matches!(c, '.' | '…' | ',' | ';' | ':') || c.is_whitespace())
}

/// Byte ranges of the answer's sentences, trimmed, in order.
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END_RE.find_iter(text) {
        push_trimmed(text, start, m.end(), &mut spans);
        start = m.end();
    }
    push_trimmed(text, start, text.len(), &mut spans);
    spans
}

fn push_trimmed(text: &str, start: usize, end: usize, spans: &mut Vec<(usize, usize)>) {
    let slice = &text[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    if !trimmed.is_empty() {
        spans.push((start + leading, start + leading + trimmed.len()));
    }
}

fn sentence_index_at(spans: &[(usize, usize)], offset: usize) -> usize {
    spans
        .iter()
        .position(|&(start, end)| offset >= start && offset < end)
        .unwrap_or_else(|| spans.len().saturating_sub(1))
}

/// Statements of fact, as opposed to questions, headings and remarks about
/// the evidence itself.
pub fn is_factual_sentence(sentence: &str) -> bool {
    let stripped = SOURCE_MARKER_RE.replace_all(sentence, "");
    let stripped = stripped.trim().trim_start_matches(['-', '*', '•']).trim();
    if stripped.ends_with('?') || stripped.ends_with(':') {
        return false;
    }
    if stripped.split_whitespace().count() < 4 {
        return false;
    }
    let lower = stripped.to_lowercase();
    !NON_FACTUAL_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Case- and whitespace-folded text with a byte map back to the original.
struct NormalizedText {
    text: String,
    /// Original byte range for every byte of `text`.
    origin: Vec<(usize, usize)>,
}

impl NormalizedText {
    fn new(original: &str) -> Self {
        let mut text = String::with_capacity(original.len());
        let mut origin = Vec::with_capacity(original.len());
        let mut pending_space: Option<(usize, usize)> = None;

        for (i, c) in original.char_indices() {
            let range = (i, i + c.len_utf8());
            if c.is_whitespace() {
                if !text.is_empty() && pending_space.is_none() {
                    pending_space = Some(range);
                }
                continue;
            }
            if let Some(space) = pending_space.take() {
                text.push(' ');
                origin.push(space);
            }
            for folded in fold_char(c) {
                text.push(folded);
                origin.extend(std::iter::repeat(range).take(folded.len_utf8()));
            }
        }

        Self { text, origin }
    }

    fn original_range(&self, start: usize, len: usize) -> Option<(usize, usize)> {
        if len == 0 {
            return None;
        }
        let first = self.origin.get(start)?;
        let last = self.origin.get(start + len - 1)?;
        Some((first.0, last.1))
    }
}

fn fold_char(c: char) -> impl Iterator<Item = char> {
    let mapped = match c {
        '‘' | '’' | '′' => '\'',
        '“' | '”' | '″' => '"',
        '–' | '—' | '‑' => '-',
        other => other,
    };
    mapped.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkMetadata, SectionKind};

    fn chunk(id: &str, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            document_id: "who-htn".to_string(),
            text: text.to_string(),
            metadata: ChunkMetadata {
                guideline_name: "WHO Hypertension Guideline".to_string(),
                section: "Definitions".to_string(),
                section_kind: SectionKind::Definition,
                page_number: Some(3),
                organization: "WHO".to_string(),
                year: Some(2021),
                population_tags: Vec::new(),
            },
            relevance_score: 0.9,
            rerank_score: Some(0.9),
            dense_rank: Some(1),
            sparse_rank: Some(1),
            sub_queries: vec![0],
        }
    }

    const HTN: &str = "Hypertension is defined as systolic blood pressure ≥140 mmHg and/or diastolic blood pressure ≥90 mmHg.";

    #[test]
    fn test_verbatim_quote_is_cited() {
        let chunks = vec![chunk("c1", HTN)];
        let answer = "According to WHO, \"hypertension is defined as systolic blood pressure ≥140 mmHg\" [1].";
        let report = CitationValidator::new(12).validate(answer, &chunks);

        assert_eq!(report.citations.len(), 1);
        let citation = &report.citations[0].citation;
        assert_eq!(citation.quote, "Hypertension is defined as systolic blood pressure ≥140 mmHg");
        assert!(HTN.contains(&citation.quote));
        assert_eq!(citation.chunk_id, "c1");
        assert!(is_verbatim(citation, &chunks));
        assert_eq!(report.coverage(), 1.0);
    }

    #[test]
    fn test_hallucinated_quote_is_discarded() {
        let chunks = vec![chunk("c1", HTN)];
        let answer = "WHO states that \"hypertension is always fatal without treatment\" [1].";
        let report = CitationValidator::new(12).validate(answer, &chunks);
        assert!(report.citations.is_empty());
        assert_eq!(report.rejected_candidates, 1);
        assert_eq!(report.coverage(), 0.0);
    }

    #[test]
    fn test_curly_quotes_whitespace_and_ellipsis() {
        let chunks = vec![chunk("c1", "Blood pressure should be\n measured   in both arms at the first visit.")];
        let answer = "Guidance: “…blood pressure should be measured in both arms…” [1]";
        let citations = extract_citations(answer, &chunks, 12);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].quote, "Blood pressure should be\n measured   in both arms");
        assert!(chunks[0].text.contains(&citations[0].quote));
    }

    #[test]
    fn test_marker_selects_chunk_and_falls_back_to_rank_order() {
        let shared = "Lifestyle modification is recommended for all adults";
        let chunks = vec![
            chunk("c1", &format!("{}. Salt intake should be reduced.", shared)),
            chunk("c2", &format!("In summary: {}.", shared)),
        ];
        let marked = extract_citations(&format!("\"{}\" [2].", shared), &chunks, 12);
        assert_eq!(marked[0].chunk_id, "c2");

        let unmarked = extract_citations(&format!("\"{}\".", shared), &chunks, 12);
        assert_eq!(unmarked[0].chunk_id, "c1");

        let wrong_marker = extract_citations("\"Salt intake should be reduced\" [2].", &chunks, 12);
        assert_eq!(wrong_marker[0].chunk_id, "c1");
    }

    #[test]
    fn test_short_quotes_and_duplicates() {
        let chunks = vec![chunk("c1", HTN)];
        assert!(extract_citations("It is \"defined\" [1].", &chunks, 12).is_empty());

        let answer = "\"Hypertension is defined as systolic blood pressure\" [1]. \
                      Again, \"hypertension is defined as systolic blood pressure\" [1].";
        assert_eq!(extract_citations(answer, &chunks, 12).len(), 1);
    }

    #[test]
    fn test_unquoted_marked_sentence_is_near_quote() {
        let chunks = vec![chunk("c1", HTN)];
        let answer = "Hypertension is defined as systolic blood pressure ≥140 mmHg [1]. It is common worldwide in adults.";
        let report = CitationValidator::new(12).validate(answer, &chunks);
        assert_eq!(report.citations.len(), 1);
        assert_eq!(report.factual_sentences, 2);
        assert_eq!(report.supported_sentences, 1);
        assert!((report.coverage() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sentence_classification() {
        assert!(is_factual_sentence("Hypertension is a major risk factor [1]."));
        assert!(!is_factual_sentence("What is hypertension?"));
        assert!(!is_factual_sentence("Key points:"));
        assert!(!is_factual_sentence("The provided guidelines do not cover dosing."));
        assert!(!is_factual_sentence("See above."));
    }

    #[test]
    fn test_sentence_spans_keep_markers_with_sentence() {
        let text = "First claim here \"quoted text.\" [1] Second claim follows. Third";
        let spans = sentence_spans(text);
        let sentences: Vec<&str> = spans.iter().map(|&(s, e)| &text[s..e]).collect();
        assert_eq!(sentences, vec!["First claim here \"quoted text.\" [1]", "Second claim follows.", "Third"]);
    }
}
