//! Medical Safety Validator
//!
//! Ordered checks over the query analysis and the generated answer:
//! 1. intent-based refusal (also run before retrieval via [`SafetyValidator::screen_query`])
//! 2. directive phrasing or ungrounded claims
//! 3. overconfident phrasing at low confidence (forces the disclaimer)
//! 4. default: safe, disclaimer for educational intents

use regex::Regex;
use std::sync::LazyLock;

use crate::config::SafetyConfig;
use crate::rag::citation_validator::is_factual_sentence;
use crate::rag::citation_validator::sentence_spans;
use crate::types::{Citation, MedicalIntent, QueryAnalysis, RefusalReason, SafetyCheck, ViolationCode};

// ============================================================================
// Response texts
// ============================================================================

pub const BASE_REFUSAL: &str = "I cannot provide that type of medical information. \
This system is designed for educational purposes only and provides information from \
medical guidelines, not personal medical advice.";

const DIAGNOSIS_REFERRAL: &str = "For diagnostic questions, please consult with a qualified \
healthcare professional who can evaluate your specific situation.";

const TREATMENT_REFERRAL: &str = "For treatment recommendations, please consult with a qualified \
healthcare professional who can assess your individual needs.";

const EDUCATIONAL_OFFER: &str = "I can help you understand what medical guidelines say about \
conditions, procedures, and general recommendations for educational purposes.";

pub const EMERGENCY_RESPONSE: &str = "If you or someone near you may be having a medical emergency, \
call your local emergency number (for example 911, 112 or 999) or go to the nearest emergency \
department immediately. If you are thinking about harming yourself, contact a crisis line or \
emergency services now. This system only provides educational information from medical \
guidelines and cannot help in an emergency.";

pub const EDUCATIONAL_DISCLAIMER: &str = "Educational Disclaimer: This information is for educational \
purposes only and is based on medical guidelines. It is not intended as medical advice, diagnosis, \
or treatment recommendations. Always consult qualified healthcare professionals for medical decisions.";

pub const NO_EVIDENCE_RESPONSE: &str = "I could not find specific information about this topic in the \
available medical guidelines. This may be because the topic is not covered in the current guideline \
database, or the question may need to be more specific.";

pub const CONVERSATIONAL_RESPONSE: &str = "Hello! I can answer educational questions about what \
medical guidelines say on conditions, recommendations, contraindications and procedures. \
I cannot give personal medical advice. What would you like to know?";

pub const SYSTEM_ERROR_RESPONSE: &str = "I encountered an error while processing your query. \
Please try again or rephrase your question.";

/// Fixed answer text that replaces a refused answer.
pub fn refusal_message(reason: RefusalReason) -> String {
    match reason {
        RefusalReason::Emergency => EMERGENCY_RESPONSE.to_string(),
        RefusalReason::DiagnosisRequest => format!("{}\n\n{}", BASE_REFUSAL, DIAGNOSIS_REFERRAL),
        RefusalReason::TreatmentAdviceRequest => format!("{}\n\n{}", BASE_REFUSAL, TREATMENT_REFERRAL),
        RefusalReason::UnsafeQuery | RefusalReason::UngroundedOrDirective => {
            format!("{}\n\n{}", BASE_REFUSAL, EDUCATIONAL_OFFER)
        }
    }
}

// ============================================================================
// Patterns
// ============================================================================

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(you should|you must|you need to|i recommend (?:that )?you|i advise you|i suggest you|take this medication|do this treatment|you have been diagnosed|you are diagnosed|you have (?:a|an) \w+ (?:infection|disease|condition|disorder)|i diagnose you|i prescribe|take this prescription|this medication for you|definitely take|certainly use|absolutely do)\b",
    )
    .expect("directive regex is valid")
});

/// Referral phrasing that is directive in form but never unsafe.
static REFERRAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\byou (?:should|must|need to) (?:always )?(?:consult|speak|talk|seek|contact|ask|see a)\b")
        .expect("referral regex is valid")
});

static OVERCONFIDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(always|never|definitely|certainly|absolutely|guaranteed?|proven|without (?:a )?doubt|undoubtedly|100%)")
        .expect("overconfident regex is valid")
});

static HEDGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(may|might|could|suggests?|generally|typically|usually|often|likely|possibl[ey]|consider|in most)\b")
        .expect("hedge regex is valid")
});

// ============================================================================
// Validator
// ============================================================================

pub struct SafetyValidator {
    config: SafetyConfig,
}

impl SafetyValidator {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    /// Intent-based refusal. Runs before retrieval so refused queries make no
    /// external calls.
    pub fn screen_query(&self, analysis: &QueryAnalysis) -> Option<SafetyCheck> {
        let (reason, violation) = match analysis.intent {
            MedicalIntent::Emergency => (RefusalReason::Emergency, ViolationCode::EmergencyQuery),
            MedicalIntent::DiagnosisRequest => (RefusalReason::DiagnosisRequest, ViolationCode::DiagnosisRequest),
            MedicalIntent::TreatmentAdviceRequest => {
                (RefusalReason::TreatmentAdviceRequest, ViolationCode::TreatmentAdviceRequest)
            }
            MedicalIntent::UnsafeOther => (RefusalReason::UnsafeQuery, ViolationCode::UnsafeQuery),
            _ => return None,
        };
        Some(SafetyCheck::refused(reason, vec![violation]))
    }

    pub fn validate(&self, analysis: &QueryAnalysis, answer: &str, citations: &[Citation], confidence: f32) -> SafetyCheck {
        // 1. Intent
        if let Some(refusal) = self.screen_query(analysis) {
            return refusal;
        }
        if analysis.intent == MedicalIntent::Conversational {
            return SafetyCheck::safe(false);
        }

        // Verified guideline quotes are the guideline speaking, not the assistant
        let own_words = strip_quotes(answer, citations);

        // 2. Grounding and directive phrasing
        let mut violations = Vec::new();
        let without_referrals = REFERRAL_RE.replace_all(&own_words, "");
        if DIRECTIVE_RE.is_match(&without_referrals) {
            violations.push(ViolationCode::DirectiveLanguage);
        }
        if citations.is_empty() && has_factual_claim(answer) {
            violations.push(ViolationCode::UngroundedClaim);
        }
        if !violations.is_empty() {
            return SafetyCheck::refused(RefusalReason::UngroundedOrDirective, violations);
        }

        // 3. Overconfidence
        let overconfident = confidence < self.config.low_confidence_threshold
            && OVERCONFIDENT_RE.is_match(&own_words)
            && !HEDGE_RE.is_match(&own_words);
        if overconfident {
            tracing::warn!(confidence, "Overconfident phrasing in low-confidence answer");
            return SafetyCheck {
                is_safe: true,
                violations: vec![ViolationCode::OverconfidentLanguage],
                requires_disclaimer: true,
                refusal_reason: None,
            };
        }

        // 4. Default
        let requires_disclaimer = (analysis.intent.is_educational() && self.config.educational_disclaimer)
            || !analysis.risk_flags.is_empty();
        SafetyCheck::safe(requires_disclaimer)
    }

    pub fn disclaimer(&self, check: &SafetyCheck) -> String {
        if check.requires_disclaimer {
            EDUCATIONAL_DISCLAIMER.to_string()
        } else {
            String::new()
        }
    }
}

fn has_factual_claim(answer: &str) -> bool {
    sentence_spans(answer)
        .iter()
        .any(|&(start, end)| is_factual_sentence(&answer[start..end]))
}

/// Lowercased answer with every verified quote removed.
fn strip_quotes(answer: &str, citations: &[Citation]) -> String {
    let mut text = answer.to_lowercase();
    for citation in citations {
        let quote = citation.quote.to_lowercase();
        if !quote.is_empty() {
            text = text.replace(&quote, " ");
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::types::RiskFlag;

    fn analysis(intent: MedicalIntent) -> QueryAnalysis {
        QueryAnalysis {
            query: "q".into(),
            intent,
            classification_confidence: 0.8,
            risk_flags: BTreeSet::new(),
            entities: Vec::new(),
            population_hint: None,
            organization_hint: None,
            sub_queries: Vec::new(),
        }
    }

    fn citation(quote: &str) -> Citation {
        Citation {
            guideline_name: "G".into(),
            section: "S".into(),
            page_number: None,
            organization: "WHO".into(),
            year: None,
            quote: quote.into(),
            chunk_id: "c1".into(),
        }
    }

    fn validator() -> SafetyValidator {
        SafetyValidator::new(SafetyConfig::default())
    }

    #[test]
    fn test_refused_intents() {
        for (intent, reason) in [
            (MedicalIntent::Emergency, RefusalReason::Emergency),
            (MedicalIntent::DiagnosisRequest, RefusalReason::DiagnosisRequest),
            (MedicalIntent::TreatmentAdviceRequest, RefusalReason::TreatmentAdviceRequest),
            (MedicalIntent::UnsafeOther, RefusalReason::UnsafeQuery),
        ] {
            let check = validator().validate(&analysis(intent), "anything", &[citation("anything")], 0.9);
            assert!(!check.is_safe);
            assert_eq!(check.refusal_reason, Some(reason));
            assert!(check.requires_disclaimer);
        }
        assert!(validator().screen_query(&analysis(MedicalIntent::Definition)).is_none());
    }

    #[test]
    fn test_directive_language_is_refused() {
        let answer = "\"Metformin is first-line therapy\" [1]. You should take 500mg twice daily.";
        let check = validator().validate(
            &analysis(MedicalIntent::Recommendation),
            answer,
            &[citation("Metformin is first-line therapy")],
            0.9,
        );
        assert!(!check.is_safe);
        assert_eq!(check.refusal_reason, Some(RefusalReason::UngroundedOrDirective));
        assert_eq!(check.violations, vec![ViolationCode::DirectiveLanguage]);
    }

    #[test]
    fn test_referrals_and_quoted_directives_are_allowed() {
        let answer = "The guideline states \"you should not use aspirin in children under 16\" [1]. \
                      You should consult a healthcare professional.";
        let check = validator().validate(
            &analysis(MedicalIntent::Contraindication),
            answer,
            &[citation("You should not use aspirin in children under 16")],
            0.9,
        );
        assert!(check.is_safe, "{:?}", check);
    }

    #[test]
    fn test_uncited_claim_is_refused() {
        let check = validator().validate(
            &analysis(MedicalIntent::Definition),
            "Hypertension is a chronic elevation of blood pressure.",
            &[],
            0.5,
        );
        assert_eq!(check.refusal_reason, Some(RefusalReason::UngroundedOrDirective));
        assert_eq!(check.violations, vec![ViolationCode::UngroundedClaim]);
    }

    #[test]
    fn test_overconfidence_forces_disclaimer_without_refusal() {
        let config = SafetyConfig {
            educational_disclaimer: false,
            ..SafetyConfig::default()
        };
        let validator = SafetyValidator::new(config);
        let answer = "\"Statins reduce cardiovascular events\" [1]. This is definitely the right approach.";
        let cites = [citation("Statins reduce cardiovascular events")];

        let low = validator.validate(&analysis(MedicalIntent::Recommendation), answer, &cites, 0.2);
        assert!(low.is_safe);
        assert!(low.requires_disclaimer);
        assert_eq!(low.violations, vec![ViolationCode::OverconfidentLanguage]);

        let high = validator.validate(&analysis(MedicalIntent::Recommendation), answer, &cites, 0.9);
        assert!(high.violations.is_empty());
        assert!(!high.requires_disclaimer);

        let hedged = "\"Statins reduce cardiovascular events\" [1]. This is definitely helpful but may vary.";
        let check = validator.validate(&analysis(MedicalIntent::Recommendation), hedged, &cites, 0.2);
        assert!(check.violations.is_empty());
    }

    #[test]
    fn test_default_disclaimer_rules() {
        let cites = [citation("Hypertension is defined as systolic blood pressure")];
        let answer = "\"Hypertension is defined as systolic blood pressure\" [1].";
        let check = validator().validate(&analysis(MedicalIntent::Definition), answer, &cites, 0.9);
        assert!(check.is_safe);
        assert!(check.requires_disclaimer);
        assert_eq!(validator().disclaimer(&check), EDUCATIONAL_DISCLAIMER);

        let check = validator().validate(&analysis(MedicalIntent::Conversational), "Hello!", &[], 1.0);
        assert!(check.is_safe);
        assert!(!check.requires_disclaimer);
        assert!(validator().disclaimer(&check).is_empty());

        let quiet = SafetyValidator::new(SafetyConfig {
            educational_disclaimer: false,
            ..SafetyConfig::default()
        });
        let mut flagged = analysis(MedicalIntent::Contraindication);
        flagged.risk_flags.insert(RiskFlag::PopulationSpecific);
        assert!(quiet.validate(&flagged, answer, &cites, 0.9).requires_disclaimer);
        assert!(!quiet.validate(&analysis(MedicalIntent::Definition), answer, &cites, 0.9).requires_disclaimer);
    }

    #[test]
    fn test_refusal_messages() {
        assert!(refusal_message(RefusalReason::Emergency).contains("emergency number"));
        assert!(refusal_message(RefusalReason::DiagnosisRequest).contains("diagnostic questions"));
        assert!(refusal_message(RefusalReason::TreatmentAdviceRequest).starts_with(BASE_REFUSAL));
        assert!(refusal_message(RefusalReason::UngroundedOrDirective).contains("educational purposes"));
    }
}
