//! Grounded answer prompts, one task block per educational intent.

use crate::types::{MedicalIntent, QueryAnalysis, RetrievedChunk};

const SYSTEM_PREAMBLE: &str = "You are a medical guideline assistant for educational use. \
You answer strictly from the numbered guideline excerpts below and never from outside knowledge.";

const GROUNDING_RULES: &str = "RULES:\n\
- Use only the text of the numbered sources. If they do not answer the question, say that the provided guidelines do not cover it.\n\
- Every factual sentence must contain a verbatim quote from a source in double quotes, followed by its source number, e.g. \"...\" [1].\n\
- Copy quotes exactly, character for character. Do not paraphrase inside quotes.\n\
- Describe what the guideline states. Never address the reader with personal advice, a diagnosis or a prescription.\n\
- Keep the answer short and factual.\n";

pub fn build_answer_prompt(analysis: &QueryAnalysis, chunks: &[RetrievedChunk]) -> String {
    let mut prompt = String::new();
    prompt.push_str(SYSTEM_PREAMBLE);
    prompt.push_str("\n\n");

    prompt.push_str("# TASK\n");
    prompt.push_str(task_instructions(analysis.intent));
    prompt.push('\n');
    if let Some(population) = analysis.population_hint {
        prompt.push_str(&format!(
            "The question concerns the {} population; mention when a source restricts its statement to a population.\n",
            population.as_str()
        ));
    }
    prompt.push('\n');
    prompt.push_str(GROUNDING_RULES);
    prompt.push('\n');

    prompt.push_str("# SOURCES\n");
    for (i, chunk) in chunks.iter().enumerate() {
        prompt.push_str(&format_source(i + 1, chunk));
        prompt.push('\n');
    }

    prompt.push_str("# QUESTION\n");
    prompt.push_str(analysis.query.trim());
    prompt.push('\n');
    if !analysis.sub_queries.is_empty() {
        prompt.push_str("\nAnswer each part:\n");
        for (i, sub_query) in analysis.sub_queries.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, sub_query));
        }
    }

    prompt.push_str("\n# ANSWER\n");
    prompt
}

fn task_instructions(intent: MedicalIntent) -> &'static str {
    match intent {
        MedicalIntent::Recommendation => {
            "State what the guidelines recommend, including the strength of the recommendation and the \
             population it applies to when the source gives them."
        }
        MedicalIntent::Contraindication => {
            "State when the guidelines say the intervention should be avoided or used with caution, \
             and any population the restriction applies to."
        }
        MedicalIntent::Procedure => {
            "Describe how the guidelines say the procedure is performed, keeping the order of steps \
             given by the source."
        }
        // Definitions and anything else answered educationally
        _ => "Define the term or condition as the guidelines define it, including any thresholds or criteria they give.",
    }
}

/// Numbered source block with its provenance line.
pub fn format_source(number: usize, chunk: &RetrievedChunk) -> String {
    let meta = &chunk.metadata;
    let mut header = format!("[{}] {}", number, meta.guideline_name);
    match meta.year {
        Some(year) => header.push_str(&format!(" ({}, {})", meta.organization, year)),
        None => header.push_str(&format!(" ({})", meta.organization)),
    }
    if !meta.section.is_empty() {
        header.push_str(&format!(", section \"{}\"", meta.section));
    }
    if let Some(page) = meta.page_number {
        header.push_str(&format!(", p. {}", page));
    }
    format!("{}\n{}\n", header, chunk.text.trim())
}
